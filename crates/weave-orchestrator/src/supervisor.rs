//! Worker process supervision.
//!
//! The orchestrator owns the worker completely, in a fixed order: it
//! creates the listener first, spawns the worker with the socket path
//! and a live stdin pipe, then accepts the worker's connect-back within
//! a deadline. Teardown is a staged escalation: closing stdin asks
//! nicely (the worker's parent-death watcher observes the EOF), SIGTERM
//! insists, SIGKILL does not ask. Whatever the exit path, dropping the
//! handle drops the listener, which unlinks the socket file — so a
//! crashed run never leaves a stale file for the next one to trip over.

use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::process::{Child, ChildStdin, Command};
use weave_transport::SocketListener;

use crate::{connection::WorkerConnection, error::SupervisorError};

/// How long the orchestrator waits for a freshly spawned worker to
/// connect back to the listener.
pub const CONNECT_BACK_DEADLINE: Duration = Duration::from_secs(10);

/// Grace periods of the staged shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownTimeouts {
    /// Wait after closing stdin before escalating.
    pub stdin_grace: Duration,
    /// Wait after SIGTERM before escalating.
    pub term_grace: Duration,
    /// Wait after SIGKILL before declaring the worker unresponsive.
    pub kill_grace: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            stdin_grace: Duration::from_secs(2),
            term_grace: Duration::from_secs(3),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// An owned, supervised worker process.
///
/// Owns the listener (and with it the socket file), the child process,
/// the stdin pipe used for lifetime binding, and the accepted
/// connection once [`WorkerHandle::accept_connection`] has run.
/// Dropping the handle force-kills a still-running worker and unlinks
/// the socket file; [`WorkerHandle::shutdown`] is the graceful path.
pub struct WorkerHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    listener: SocketListener,
    connection: Option<WorkerConnection>,
}

impl WorkerHandle {
    /// Bring a worker up the whole way: create the listener, spawn the
    /// binary against it, accept its connect-back.
    ///
    /// The order is load-bearing. The listener must exist before the
    /// child does, so the path the worker dials is already bound (with
    /// any stale file from a crashed run recovered) by the time the
    /// worker looks for it.
    pub async fn launch(
        worker_binary: &Path,
        socket_path: &Path,
        deadline: Duration,
    ) -> Result<Self, SupervisorError> {
        let listener = SocketListener::bind(socket_path)?;
        let mut handle = Self::spawn(worker_binary, listener)?;
        handle.accept_connection(deadline).await?;
        Ok(handle)
    }

    /// Spawn the worker binary against a pre-created listener.
    ///
    /// The listener must already be bound (it is, by construction of
    /// [`SocketListener`]); its path becomes the worker's
    /// `--socket-path` argument. Standard input is piped and held open
    /// for lifetime binding; stdout and stderr stay attached to the
    /// orchestrator so worker logs land in the same place as ours.
    pub fn spawn(
        worker_binary: &Path,
        listener: SocketListener,
    ) -> Result<Self, SupervisorError> {
        let mut command = Command::new(worker_binary);
        command
            .arg("--socket-path")
            .arg(listener.path())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        Self::spawn_command(command, listener)
    }

    /// Spawn an arbitrary command under worker supervision.
    ///
    /// The command's stdin is re-piped regardless of prior configuration;
    /// the stdin pipe is the lifetime binding.
    pub fn spawn_command(
        mut command: Command,
        listener: SocketListener,
    ) -> Result<Self, SupervisorError> {
        command.stdin(Stdio::piped());
        // Backstop: if the handle is dropped without a staged shutdown,
        // the runtime delivers SIGKILL rather than leaking the child.
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let stdin = child.stdin.take();

        tracing::info!(pid = child.id(), "worker spawned");

        Ok(Self { child, stdin, listener, connection: None })
    }

    /// Accept the worker's connect-back on the owned listener.
    pub async fn accept_connection(
        &mut self,
        deadline: Duration,
    ) -> Result<&WorkerConnection, SupervisorError> {
        let connection = WorkerConnection::accept_connection(&self.listener, deadline).await?;
        Ok(self.connection.insert(connection))
    }

    /// The established connection, if [`Self::accept_connection`] has
    /// run.
    #[must_use]
    pub fn connection(&self) -> Option<&WorkerConnection> {
        self.connection.as_ref()
    }

    /// Process id of the worker, while it is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// The socket path this worker connects back to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    /// Staged shutdown: close stdin, then SIGTERM, then SIGKILL, each
    /// with its grace period.
    ///
    /// The multiplexed connection is closed first so its reader task is
    /// gone before the process goes away. Whatever the exit path, the
    /// handle (and so the listener) is dropped when this returns, which
    /// unlinks the socket file.
    ///
    /// # Errors
    ///
    /// `WorkerUnresponsive` if the worker survives even SIGKILL's grace
    /// period (which indicates a kernel-stuck process).
    pub async fn shutdown(
        mut self,
        timeouts: ShutdownTimeouts,
    ) -> Result<ExitStatus, SupervisorError> {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }

        // Stage 1: EOF on stdin. The worker's parent-death watcher turns
        // this into a graceful drain-and-exit.
        drop(self.stdin.take());
        if let Some(status) = wait_with(&mut self.child, timeouts.stdin_grace).await? {
            return Ok(reaped(status));
        }

        // Stage 2: polite signal.
        tracing::warn!("worker ignored stdin close, sending SIGTERM");
        self.signal(Signal::SIGTERM);
        if let Some(status) = wait_with(&mut self.child, timeouts.term_grace).await? {
            return Ok(reaped(status));
        }

        // Stage 3: no more asking.
        tracing::warn!("worker ignored SIGTERM, sending SIGKILL");
        if let Err(err) = self.child.start_kill() {
            tracing::warn!(%err, "SIGKILL delivery failed");
        }
        if let Some(status) = wait_with(&mut self.child, timeouts.kill_grace).await? {
            return Ok(reaped(status));
        }

        Err(SupervisorError::WorkerUnresponsive)
    }

    fn signal(&self, signal: Signal) {
        if let Some(pid) = self.child.id()
            && let Err(err) = signal::kill(Pid::from_raw(pid as i32), signal)
        {
            tracing::debug!(%err, ?signal, "signal delivery failed");
        }
    }
}

fn reaped(status: ExitStatus) -> ExitStatus {
    if status.success() {
        tracing::info!("worker exited cleanly");
    } else {
        tracing::warn!(%status, "worker exited abnormally");
    }
    status
}

/// Wait for the child up to `grace`; `None` means it is still running.
async fn wait_with(
    child: &mut Child,
    grace: Duration,
) -> Result<Option<ExitStatus>, SupervisorError> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}
