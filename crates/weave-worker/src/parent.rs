//! Parent-death detection via stdin.
//!
//! The orchestrator spawns the worker with a live pipe on its standard
//! input and never writes to it. When the orchestrator exits for any
//! reason the kernel closes the pipe, the watcher observes EOF, and the
//! worker shuts down instead of orphaning. Pipe-close-on-exit is
//! portable; platform-specific die-with-parent flags would only be
//! defense in depth on top of this.

use std::{io::Read, thread};

use weave_transport::ShutdownFlag;

/// Drain a parent-liveness stream until EOF, then request shutdown.
///
/// Any bytes that do arrive are discarded; only the close matters. A
/// read error is treated the same as EOF, since either way the pipe no
/// longer proves a live parent.
pub fn watch_parent<R: Read>(mut reader: R, flag: &ShutdownFlag) {
    let mut sink = [0u8; 64];
    loop {
        match reader.read(&mut sink) {
            Ok(0) => {
                tracing::info!("stdin closed, parent is gone; requesting shutdown");
                flag.trigger();
                return;
            },
            Ok(_) => {},
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {},
            Err(err) => {
                tracing::debug!(%err, "stdin watch failed; requesting shutdown");
                flag.trigger();
                return;
            },
        }
    }
}

/// Spawn the stdin watcher on its own thread.
pub fn spawn_stdin_watch(flag: ShutdownFlag) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("parent-watch".into())
        .spawn(move || watch_parent(std::io::stdin(), &flag))
        .unwrap_or_else(|err| {
            // Thread spawn failing at startup means the process cannot
            // meet its lifetime contract; treat as fatal.
            tracing::error!(%err, "failed to spawn stdin watcher");
            std::process::exit(1);
        })
}
