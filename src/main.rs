//! CLI entry point: loads a `.torrent` file and downloads it to the current
//! (or given) directory, driving the tracker loop and peer session pool to
//! completion on a single-threaded runtime.
use anyhow::{Context, Result};
use bittide::config::Config;
use bittide::peer;
use bittide::scheduler::Scheduler;
use bittide::torrent::Torrent;
use bittide::tracker::{self, Tracker};
use clap::Parser;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Downloads a single-file torrent.
#[derive(Parser, Debug)]
#[command(name = "bittide", version, about)]
struct Cli {
    /// Path to the `.torrent` file to download.
    torrent_path: PathBuf,

    /// Directory the output file is written into (defaults to the current directory).
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::default();

    let torrent = Torrent::load(&cli.torrent_path)
        .with_context(|| format!("failed to load torrent at {}", cli.torrent_path.display()))?;
    tracing::info!(
        name = %torrent.output_name,
        pieces = torrent.total_pieces(),
        total_size = torrent.total_size,
        "loaded torrent"
    );

    let scheduler = Scheduler::new(&torrent, &config, &cli.output_dir)
        .context("failed to initialize the piece scheduler")?;
    let scheduler = Rc::new(RefCell::new(scheduler));

    let tracker_client = Tracker::new(&torrent, &config);
    let my_peer_id = tracker_client.peer_id();

    let (peer_tx, peer_rx) = tokio::sync::mpsc::unbounded_channel();

    let total_size = torrent.total_size;
    let announce_scheduler = Rc::clone(&scheduler);
    tokio::task::spawn_local(tracker::run_announce_loop(
        tracker_client,
        total_size,
        peer_tx,
        move || announce_scheduler.borrow().bytes_downloaded(),
        config.default_announce_interval,
        config.tracker_poll_interval,
    ));

    let pool_scheduler = Rc::clone(&scheduler);
    let pool = tokio::task::spawn_local(peer::run_pool(
        config.max_peer_connections,
        peer_rx,
        pool_scheduler,
        torrent.info_hash,
        my_peer_id,
    ));

    loop {
        if scheduler.borrow().complete() {
            tracing::info!("download complete");
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    pool.abort();
    scheduler
        .borrow_mut()
        .close()
        .context("failed to flush the output file")?;

    Ok(())
}
