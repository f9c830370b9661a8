use anyhow::{Context, bail};
use clap::Parser;
use playtrack::{
    DurabilityMode, InMemoryStorage, SnapshotSignalSource, Tracker, TrackerConfig, scheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Record play sessions from a presence snapshot file
#[derive(Debug, Parser)]
#[command(name = "playtrack", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = TrackerConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    let storage = match config.data_dir {
        Some(ref dir) if config.durability != DurabilityMode::None => {
            let storage = InMemoryStorage::open(dir, config.durability)
                .await
                .with_context(|| format!("failed to open data dir {}", dir.display()))?;
            storage
                .set_checkpoint_threshold(config.checkpoint_threshold)
                .await;
            storage
        }
        _ => InMemoryStorage::new(),
    };
    let storage = Arc::new(storage);

    let Some(ref signal_file) = config.signal_file else {
        bail!("config has no signal_file to read presence from");
    };
    let source = SnapshotSignalSource::from_file(signal_file)
        .await
        .with_context(|| format!("failed to read signal file {}", signal_file.display()))?;

    let tracker = Tracker::start(Arc::clone(&storage), source, &config)
        .await
        .context("failed to start tracker")?;
    info!(persistent = storage.is_persistence_enabled(), "playtrack ready");

    if args.once {
        let report = tracker
            .tick(chrono::Utc::now())
            .await
            .context("tick aborted")?;
        info!(
            processed = report.processed(),
            opened = report.sessions_opened,
            closed = report.sessions_closed,
            "single tick finished"
        );
    } else {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };
        scheduler::run(&tracker, config.interval(), shutdown).await;
    }

    storage.checkpoint().await.context("final checkpoint failed")?;
    Ok(())
}
