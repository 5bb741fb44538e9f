//! Weave worker binary.
//!
//! Spawned by the orchestrator with the socket path of its listener as
//! an argument and a live pipe on standard input. Connects back and
//! serves framed requests until shutdown is requested by signal or by
//! the parent going away, then exits 0. Startup failures are fatal and
//! exit non-zero.
//!
//! ```bash
//! weave-worker --socket-path /run/user/1000/weave/weave.sock
//! ```
//!
//! Without `--socket-path` the path is derived from `XDG_RUNTIME_DIR`.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use weave_transport::{ShutdownFlag, runtime_socket_path};
use weave_worker::{PatternGenerator, serve, spawn_stdin_watch};

/// Weave image-generation worker
#[derive(Parser, Debug)]
#[command(name = "weave-worker")]
#[command(about = "Weave GPU worker process")]
#[command(version)]
struct Args {
    /// Absolute path of the orchestrator's Unix socket
    #[arg(long)]
    socket_path: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let socket_path = match args.socket_path {
        Some(path) => {
            if !path.is_absolute() {
                return Err(format!("--socket-path must be absolute: {}", path.display()).into());
            }
            path
        },
        None => runtime_socket_path()?,
    };

    tracing::info!(path = %socket_path.display(), "weave worker starting");

    let flag = ShutdownFlag::new();
    flag.install_signal_handlers()?;
    spawn_stdin_watch(flag.clone());

    let mut generator = PatternGenerator::new();

    serve(&socket_path, &mut generator, &flag)?;

    tracing::info!("weave worker exiting");
    Ok(())
}
