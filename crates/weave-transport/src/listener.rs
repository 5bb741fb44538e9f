//! Listener lifecycle: bind, stale-socket recovery, authentication.
//!
//! The socket file and its directory are created with user-only modes
//! (0o600 and 0o700). A leftover socket file from a crashed predecessor
//! is detected by probing it with a connect: refusal proves nobody is
//! listening and the file is safe to unlink; success proves a live owner
//! and binding fails with a distinct error instead of clobbering it.
//!
//! Accepting a connection is unauthenticated. [`authenticate`] must run
//! before any byte is read from or written to an accepted socket.

use std::{
    fs,
    io,
    os::unix::{
        fs::{DirBuilderExt, PermissionsExt},
        net::{SocketAddr, UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    sys::socket::{getsockopt, sockopt::PeerCredentials},
    unistd::Uid,
};

use crate::{
    error::{Result, TransportError},
    path::check_path_len,
};

/// Directory mode for the socket's parent directory.
pub const SOCKET_DIR_MODE: u32 = 0o700;

/// File mode applied to the socket after bind.
pub const SOCKET_FILE_MODE: u32 = 0o600;

/// Read timeout applied to every accepted peer socket.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Write timeout applied to every accepted peer socket.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials of the process on the other end of a Unix socket, as
/// reported by the kernel. Unforgeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    /// Effective user id of the peer at connect time.
    pub uid: u32,
    /// Effective group id of the peer at connect time.
    pub gid: u32,
    /// Process id of the peer at connect time.
    pub pid: i32,
}

/// A bound Unix listener that owns its socket file.
///
/// Dropping the listener unlinks the file, so every exit path cleans up
/// without dedicated error handling.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind a listener at `path`, recovering a stale socket file if one
    /// is present.
    ///
    /// The parent directory is created with mode 0o700 if missing, and
    /// the socket file itself is chmodded to 0o600 right after bind.
    ///
    /// # Errors
    ///
    /// `PathTooLong` for a path that cannot fit a `sockaddr_un`,
    /// `AddressInUse` when a live process answers at the path, and any
    /// underlying I/O failure.
    pub fn bind(path: &Path) -> Result<Self> {
        check_path_len(path)?;

        if let Some(dir) = path.parent()
            && !dir.exists()
        {
            fs::DirBuilder::new().recursive(true).mode(SOCKET_DIR_MODE).create(dir)?;
        }

        if path.exists() {
            Self::recover_stale(path)?;
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_FILE_MODE))?;

        tracing::info!(path = %path.display(), "listening");

        Ok(Self { listener, path: path.to_path_buf() })
    }

    /// Probe an existing socket file and unlink it if it is stale.
    ///
    /// A successful connect means another process is serving the path;
    /// that is reported, never clobbered. A refused connect means the
    /// previous owner died without unlinking; the file is removed and
    /// the (single) bind attempt proceeds. `NotFound` means the file
    /// vanished between the existence check and the probe, which is
    /// equally fine. Everything else propagates.
    fn recover_stale(path: &Path) -> Result<()> {
        match UnixStream::connect(path) {
            Ok(_) => Err(TransportError::AddressInUse(path.to_path_buf())),
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::info!(path = %path.display(), "removing stale socket file");
                fs::remove_file(path)?;
                Ok(())
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    /// Accept one connection.
    pub fn accept(&self) -> io::Result<(UnixStream, SocketAddr)> {
        self.listener.accept()
    }

    /// Switch the listener between blocking and non-blocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    /// The socket path this listener owns.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), %err, "socket unlink failed");
        }
    }
}

/// Verify the process on the other end of a connected socket against
/// our own user id.
///
/// Works on either end of the connection; both the accepting and the
/// connecting side call this before any read or write. On mismatch the
/// caller closes the socket without sending a byte; the rejected uid
/// and pid are logged at debug level.
///
/// # Errors
///
/// `PeerUnauthenticated` on a uid mismatch; `Io` if the kernel query
/// itself fails.
pub fn authenticate(stream: &UnixStream) -> Result<PeerCreds> {
    let creds = getsockopt(stream, PeerCredentials).map_err(io::Error::from)?;
    let peer = PeerCreds { uid: creds.uid(), gid: creds.gid(), pid: creds.pid() };

    if Uid::from_raw(peer.uid) != Uid::effective() {
        tracing::debug!(uid = peer.uid, pid = peer.pid, "rejecting peer with foreign uid");
        return Err(TransportError::PeerUnauthenticated { uid: peer.uid, pid: peer.pid });
    }

    Ok(peer)
}

/// Apply the per-peer read and write timeouts.
pub fn apply_timeouts(stream: &UnixStream) -> io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(())
}

/// Client-side connect to a bound socket.
///
/// No authentication happens here: the kernel presents our credentials
/// to the accepting side, and either side may run [`authenticate`] on
/// the resulting stream before trusting it.
pub fn connect_to(path: &Path) -> Result<UnixStream> {
    check_path_len(path)?;
    Ok(UnixStream::connect(path)?)
}
