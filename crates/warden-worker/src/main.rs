//! Warden Worker - executes registered functions on behalf of a host.
//!
//! Spawned by a host as `warden-worker <peer-library> <host-version> [options]`.
//! Requests arrive on stdin and responses leave on stdout, so all logging goes
//! to stderr, where the host relays it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use warden_core::{Listener, WorkerInfo};

#[derive(Parser, Debug)]
#[command(name = "warden-worker")]
#[command(about = "Worker process for warden")]
struct Args {
    /// Location of the host's peer library
    peer_library: PathBuf,

    /// Version triple of the host
    host_version: semver::Version,

    /// Directory to search before PATH (repeatable)
    #[arg(long = "search-path")]
    search_path: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging (stdout is the protocol channel)
    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!(
        "Starting warden worker {} for host {}",
        env!("CARGO_PKG_VERSION"),
        args.host_version
    );
    debug!("Peer library: {}", args.peer_library.display());

    let info = WorkerInfo {
        peer_library: Some(args.peer_library),
        host_version: Some(args.host_version.to_string()),
        search_paths: args.search_path,
        same_process: false,
    };

    let mut listener = Listener::new(info);
    listener
        .listen(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker pipe failed")?;

    info!("Worker exiting");
    Ok(())
}
