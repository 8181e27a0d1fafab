//! drift - directory replication across hosts
//!
//! `drift push` walks a local source and pushes it to a remote file server;
//! `drift monitor` subscribes to a remote source's change stream and
//! applies it locally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use driftsync::cli::ConnOpts;
use driftsync::logging::init_logging;
use driftsync::monitor::{MonitorConfig, RemoteClientMonitor};
use driftsync::push::PushClientSync;
use driftsync::syncer::{LogSyncer, Syncer};
use driftsync::vfs::Vfs;

#[derive(Parser, Debug)]
#[command(
    name = "drift",
    version,
    about = "Directory replication: push a local tree to a remote file server, or mirror a remote source locally"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a local source and push every entry to the remote destination
    Push {
        /// Local source directory
        source: String,

        /// Remote destination (drift://host[:port]/path, drifts:// for TLS)
        dest: String,

        #[command(flatten)]
        conn: ConnOpts,
    },
    /// Subscribe to a remote source and apply its change stream locally
    Monitor {
        /// Remote source (drift://host[:port]/path, drifts:// for TLS)
        source: String,

        /// Run one full sync, then exit
        #[arg(long)]
        sync_once: bool,

        /// Trigger a full sync every N seconds
        #[arg(long, value_name = "SECS")]
        sync_interval: Option<u64>,

        /// Debounce window for in-flight writes, in milliseconds
        #[arg(long, value_name = "MS")]
        settle_ms: Option<u64>,

        #[command(flatten)]
        conn: ConnOpts,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().context("build runtime")?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Push { source, dest, conn } => {
            init_logging(conn.verbose.max(1))?;
            let source_vfs = Vfs::parse(&source)?;
            let dest_vfs = Vfs::parse(&dest)?;
            anyhow::ensure!(!source_vfs.is_remote(), "push source must be local");
            anyhow::ensure!(dest_vfs.is_remote(), "push destination must be remote");

            let root = source_vfs.abs()?;
            let pusher = PushClientSync::connect(
                source_vfs,
                dest_vfs,
                conn.parse_users()?,
                None,
                conn.ignore(),
                conn.retry(),
            )
            .await
            .context("connect push client")?;
            tracing::info!(push_addr = %pusher.push_addr(), "connected, starting full sync");
            pusher.sync_once(&root.to_string_lossy()).await?;
            tracing::info!("push sync complete");
            Ok(())
        }
        Command::Monitor {
            source,
            sync_once,
            sync_interval,
            settle_ms,
            conn,
        } => {
            init_logging(conn.verbose.max(1))?;
            let source_vfs = Vfs::parse(&source)?;
            let config = MonitorConfig {
                sync_once,
                sync_interval: sync_interval.map(Duration::from_secs),
                settle_window: settle_ms.map(Duration::from_millis),
            };
            let syncer: Arc<dyn Syncer> = Arc::new(LogSyncer);
            let monitor = RemoteClientMonitor::new(
                &source_vfs,
                syncer,
                conn.retry(),
                config,
                conn.parse_users()?,
                conn.event_log()?,
                conn.ignore(),
            )?;
            let wait = monitor.start().await.context("start monitor")?;

            let m = monitor.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    let _ = m.shutdown();
                }
            });

            wait.wait().await
        }
    }
}
