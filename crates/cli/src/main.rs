//! mirsync: one-way directory mirroring over TCP
//!
//! A sender watches a local tree and pushes block-level deltas to a
//! receiver, which applies them under its own root. Restarting either end
//! is safe: the next pass rediscovers deltas from checksums alone.

mod watch;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, CommandFactory, Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mirsync_core::config::SyncConfig;
use mirsync_core::queue::TransferQueue;
use mirsync_core::scan;
use mirsync_transport::{ReceiverService, RemoteReceiver, Sender, TransferManager};

const DEFAULT_PORT: u16 = 9999;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "mirsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "One-way directory mirroring over TCP")]
#[command(long_about = r#"
mirsync keeps a remote copy of a directory tree in step with a local one.

The sender watches for changes and pushes only the blocks that differ;
the receiver applies them under its own root. Neither end keeps state
beyond the trees themselves, so either side can be restarted freely.

Examples:
  mirsync serve ./project backup-host        Push ./project to backup-host:9999
  mirsync receive /srv/backup 9999           Apply incoming changes under /srv/backup
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and push its changes to a receiver
    Serve {
        /// Directory to mirror
        path: PathBuf,

        /// Receiver host
        remote_host: String,

        /// Receiver port
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Listen for a sender and apply mutations under a directory
    Receive {
        /// Directory to mirror into
        path: PathBuf,

        /// Listen port
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { path, remote_host, port } => serve(&path, &remote_host, port).await,
        Commands::Receive { path, port } => receive(&path, port).await,
    }
}

/// Reject a bad argument with a usage message, exit code 1.
fn bad_argument(message: &str) -> ! {
    eprintln!("Error: {message}");
    eprintln!();
    eprintln!("{}", Cli::command().render_usage());
    std::process::exit(1);
}

fn resolve_root(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(root) if root.is_dir() => root,
        Ok(_) => bad_argument(&format!("{} is not a directory", path.display())),
        Err(err) => bad_argument(&format!("{}: {err}", path.display())),
    }
}

async fn serve(path: &Path, remote_host: &str, port: u16) -> Result<()> {
    let root = resolve_root(path);
    let config = SyncConfig::load(&root).map_err(|err| eyre!(err))?;

    let addr = format!("{remote_host}:{port}");
    info!("connecting to {addr}");
    let remote = RemoteReceiver::connect(addr.as_str(), Duration::from_millis(config.rpc_timeout_ms))
        .await
        .map_err(|err| eyre!(err))?;
    let sender = Sender::new(root.clone(), config.block_size, remote);

    let (queue, rx) = TransferQueue::new(root.clone(), config.queue_capacity);
    let cancel = CancellationToken::new();

    // The consumer must be draining before the scan fills the bounded
    // queue, or a tree larger than the capacity would stall startup.
    let manager = TransferManager::new(sender, rx, config.retry, cancel.clone());
    let manager_task = tokio::spawn(manager.run());

    // Everything already on disk goes through the same queue as live
    // changes; the block diff decides per file whether bytes move. The
    // watch starts only after the scan has enqueued the existing tree.
    let scan_root = root.clone();
    let items = tokio::task::spawn_blocking(move || scan::scan_tree(&scan_root))
        .await?
        .map_err(|err| eyre!(err))?;
    info!(items = items.len(), "initial scan complete");
    for item in items {
        if let Err(err) = queue.add(item).await {
            warn!(%err, "skipping unsyncable path");
        }
    }

    let watch_task = {
        let root = root.clone();
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = watch::run(root, queue, cancel).await {
                error!(%err, "watcher stopped");
            }
        })
    };
    drop(queue);

    info!("watching {} (ctrl-c to stop)", root.display());
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();

    let _ = manager_task.await;
    let _ = watch_task.await;
    Ok(())
}

async fn receive(path: &Path, port: u16) -> Result<()> {
    let root = resolve_root(path);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| eyre!("failed to bind port {port}: {err}"))?;
    info!("listening on port {port}, applying under {}", root.display());

    let cancel = CancellationToken::new();
    let service = ReceiverService::new(root, cancel.clone());

    tokio::select! {
        result = service.serve(listener) => result.map_err(|err| eyre!(err))?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_parses_with_default_port() {
        let cli = Cli::try_parse_from(["mirsync", "serve", "/tmp/src", "backup-host"]).unwrap();
        match cli.command {
            Commands::Serve { path, remote_host, port } => {
                assert_eq!(path, PathBuf::from("/tmp/src"));
                assert_eq!(remote_host, "backup-host");
                assert_eq!(port, DEFAULT_PORT);
            }
            Commands::Receive { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn receive_parses_with_explicit_port() {
        let cli = Cli::try_parse_from(["mirsync", "receive", "/srv/backup", "8844"]).unwrap();
        match cli.command {
            Commands::Receive { path, port } => {
                assert_eq!(path, PathBuf::from("/srv/backup"));
                assert_eq!(port, 8844);
            }
            Commands::Serve { .. } => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn missing_arguments_fail_to_parse() {
        assert!(Cli::try_parse_from(["mirsync", "serve"]).is_err());
        assert!(Cli::try_parse_from(["mirsync"]).is_err());
    }
}
