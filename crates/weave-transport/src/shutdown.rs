//! Process-wide graceful-shutdown flag.
//!
//! Signals are process-scoped, so this is the one piece of global state
//! in the system. Handlers perform exactly one async-signal-safe
//! operation: an atomic store into the flag. All I/O and cleanup happen
//! on the main loop after it observes the flag.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Atomically observable shutdown request.
///
/// Clones share the same underlying flag. The accept loop polls it
/// between accepts; signal handlers and the parent-death watcher set it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Request shutdown. Safe to call from any thread, any number of
    /// times.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Install SIGTERM and SIGINT handlers that set this flag.
    ///
    /// The registered handlers do nothing but the atomic store; in
    /// particular they never allocate, lock, or perform I/O.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&self.0))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_unset_and_latches() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());

        flag.trigger();
        assert!(flag.is_set());

        // Idempotent.
        flag.trigger();
        assert!(flag.is_set());
    }

    #[test]
    fn clones_share_state() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        flag.trigger();
        assert!(observer.is_set());
    }
}
