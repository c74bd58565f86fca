//! CLI entry point for wearsync
//!
//! Provides command-line interface for:
//! - Replaying captured notification payloads into the sample journal
//! - Running one on-demand sync
//! - Showing buffered-sample status
//! - Running as a daemon fed by the BLE layer over stdin
//!
//! # Usage
//!
//! ```bash
//! wearsync ingest --source wrist --file capture.txt
//! wearsync sync
//! wearsync status
//! printf 'wrist O2:97.5,HR:88\n' | wearsync daemon
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use wearsync::capture::{parse_payload, parse_tagged_line};
use wearsync::config::{WearSyncConfig, DEFAULT_CONFIG_PATH};
use wearsync::scheduler::SyncScheduler;
use wearsync::{
    ingest_channel, logging, HttpIngestClient, PacketDecoder, SampleStore, SourceTag,
    SyncCoordinator,
};

#[derive(Parser)]
#[command(name = "wearsync")]
#[command(about = "Wearable telemetry buffer and sync", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode and store every payload line of a capture file
    Ingest {
        /// Peripheral the capture came from (wrist or chest)
        #[arg(long)]
        source: SourceTag,

        /// Capture file, one payload per line (`hex:<bytes>` or text)
        #[arg(long)]
        file: PathBuf,
    },

    /// Send one batch now
    Sync,

    /// Show the latest sample and the pending count
    Status,

    /// Read `<wrist|chest> <payload>` lines from stdin and sync periodically
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WearSyncConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Ingest { source, file } => ingest_file(&config, source, file).await,
        Commands::Sync => sync_once(&config).await,
        Commands::Status => status(&config),
        Commands::Daemon => run_daemon(&config).await,
    }
}

fn open_store(config: &WearSyncConfig) -> Result<Arc<SampleStore>> {
    let store = SampleStore::open(&config.storage.path, config.store_options())
        .with_context(|| format!("opening {}", config.storage.path.display()))?;
    Ok(Arc::new(store))
}

fn coordinator(config: &WearSyncConfig, store: Arc<SampleStore>) -> Result<SyncCoordinator> {
    let client = HttpIngestClient::new(
        &config.ingest.base_url,
        &config.ingest.api_key,
        config.ingest_timeout(),
    )?;
    Ok(SyncCoordinator::new(
        store,
        Arc::new(client),
        config.identity.user_id.clone(),
        config.identity.team_id.clone(),
        config.sync.batch_size,
    ))
}

fn decoder(config: &WearSyncConfig) -> PacketDecoder {
    PacketDecoder::new(config.identity.user_id.clone(), config.identity.team_id.clone())
}

async fn ingest_file(config: &WearSyncConfig, source: SourceTag, file: PathBuf) -> Result<()> {
    let store = open_store(config)?;
    let (hub, worker) = ingest_channel(decoder(config), store, config.sync.queue_capacity);
    let worker = tokio::spawn(worker.run());

    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let handle = hub.source(source);
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_payload(line) {
            Ok(payload) => handle.deliver(payload).await?,
            Err(e) => tracing::warn!(line = n + 1, error = %e, "Skipping capture line"),
        }
    }
    drop(handle);
    drop(hub);

    let stats = worker.await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn sync_once(config: &WearSyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let report = coordinator(config, store.clone())?.tick().await;
    println!("{report:?}");
    println!("pending: {}", store.pending_count());
    Ok(())
}

fn status(config: &WearSyncConfig) -> Result<()> {
    let store = open_store(config)?;
    println!("pending: {}", store.pending_count());
    match store.latest() {
        Some(sample) => println!("latest: {}", serde_json::to_string_pretty(&sample)?),
        None => println!("latest: none"),
    }
    Ok(())
}

async fn run_daemon(config: &WearSyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let (hub, worker) = ingest_channel(decoder(config), store.clone(), config.sync.queue_capacity);
    let worker = tokio::spawn(worker.run());

    let scheduler = SyncScheduler::new(
        Arc::new(coordinator(config, store)?),
        config.sync_interval(),
        config.retry_policy(),
    );
    let trigger = scheduler.trigger();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(scheduler.run(shutdown_rx));

    let reader = {
        let wrist = hub.source(SourceTag::Wrist);
        let chest = hub.source(SourceTag::Chest);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "sync" {
                    trigger.trigger();
                    continue;
                }
                let (tag, payload) = match parse_tagged_line(line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring input line");
                        continue;
                    }
                };
                let source = match tag {
                    SourceTag::Wrist => &wrist,
                    SourceTag::Chest => &chest,
                };
                if let Err(e) = source.try_deliver(payload) {
                    tracing::warn!(source = %source.tag(), error = %e, "Packet not queued");
                }
            }
            tracing::info!("Input closed");
        })
    };
    drop(hub);

    tracing::info!("Daemon running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    reader.abort();
    let _ = reader.await;
    let _ = shutdown_tx.send(true);
    scheduler.await?;
    let stats = worker.await?;
    tracing::info!(
        appended = stats.appended,
        decode_failures = stats.decode_failures,
        dropped = stats.dropped,
        "Daemon stopped"
    );
    Ok(())
}
