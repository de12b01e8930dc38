#![warn(missing_docs)]

//! `courier`: ships lines from a file or standard input to log collectors.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use courier_transport::config::load_file;
use courier_transport::{
    CancelReason, Registrar, ShipperConfig, Spooler, TlsDialer, TransportError, WorkerPool,
};
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Acknowledged TLS log shipper", long_about = None)]
struct Cli {
    /// Shipper configuration file (.toml or .json).
    #[arg(short, long, env = "COURIER_CONFIG", default_value = "/etc/courier/courier.toml")]
    config: PathBuf,

    /// Overrides the configured number of delivery workers.
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config: ShipperConfig = load_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;

    let dialer = Arc::new(TlsDialer::from_config(&config.transport)?);
    let mut registrar = Registrar::new(config.state_file.clone())?;

    let (source, offset) = match &config.source {
        Some(path) => {
            let name = path.display().to_string();
            let offset = registrar.state().offset(&name).unwrap_or(0);
            (name, offset)
        }
        None => ("-".to_string(), 0),
    };
    registrar.start_at(&source, offset);
    let reader = open_source(config.source.as_ref(), offset).await?;
    let host = config
        .host
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());

    tracing::info!(source = %source, offset, host = %host, workers = config.workers, "courier starting");

    let mut pool = WorkerPool::new(config.transport.clone(), dialer)?;
    let (input_tx, input_rx) = mpsc::channel(config.workers * 2);
    let (acked_tx, acked_rx) = mpsc::channel(config.workers * 2);
    pool.spawn(config.workers, input_rx, acked_tx)?;
    let registrar_task = tokio::spawn(registrar.run(acked_rx));

    let cancel = pool.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            cancel.cancel(CancelReason::Signal);
        }
    });

    let metrics = pool.metrics();
    let spooler = Spooler::new(source, host, config.spool_size, config.idle_flush())
        .with_fields(config.fields.clone());
    match spooler.run(reader, offset, input_tx, pool.cancel_token()).await {
        Ok(read_to) => tracing::info!(offset = read_to, "input finished"),
        Err(TransportError::Cancelled) => tracing::warn!("delivery workers stopped before input was drained"),
        Err(e) => tracing::error!(error = %e, "reading input failed"),
    }

    let joined = pool.join().await;
    let state = registrar_task.await.context("registrar task panicked")??;
    let snapshot = metrics.snapshot();
    tracing::info!(
        batches_acked = snapshot.batches_acked,
        events_acked = snapshot.events_acked,
        reconnects = snapshot.reconnects,
        sources = state.offsets.len(),
        "courier stopped"
    );
    joined?;
    Ok(())
}

async fn open_source(path: Option<&PathBuf>, offset: u64) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    match path {
        Some(path) => {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            if offset > 0 {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
            }
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdin())),
    }
}
