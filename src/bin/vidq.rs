//! vidq CLI: run the ingestion pipeline or push a video into one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use vidq::catalog::Catalog;
use vidq::codec;
use vidq::config::Config;
use vidq::engine::Pipeline;
use vidq::event::EventBus;
use vidq::model::VideoMetadata;
use vidq::storage::DiskStore;
use vidq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "vidq", about = "Video ingestion queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run listeners and workers until Ctrl-C
    Serve {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of worker slots (one port and one worker each)
        #[arg(long)]
        workers: Option<u32>,
        /// Queue capacity before arrivals are dropped
        #[arg(long)]
        queue_capacity: Option<usize>,
        /// Port of worker slot 1
        #[arg(long)]
        base_port: Option<u16>,
        /// Root directory for stored videos
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
    /// Send a video file as one frame
    Send {
        /// File to send
        file: PathBuf,
        /// Host to connect to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Target port
        #[arg(long)]
        port: u16,
        /// MIME type recorded in the metadata
        #[arg(long, default_value = "video/mp4")]
        content_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            workers,
            queue_capacity,
            base_port,
            storage_dir,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(n) = workers {
                config.worker_count = n;
            }
            if let Some(n) = queue_capacity {
                config.queue_capacity = n;
            }
            if let Some(p) = base_port {
                config.base_port = p;
            }
            if let Some(dir) = storage_dir {
                config.storage_dir = dir;
            }
            cmd_serve(config).await
        }
        Command::Send {
            file,
            host,
            port,
            content_type,
        } => cmd_send(&file, &host, port, content_type).await,
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "vidq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    config.validate()?;
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("cannot create {}", config.storage_dir.display()))?;

    let catalog = Arc::new(Catalog::new());
    let store = Arc::new(DiskStore::new(&config.storage_dir, Arc::clone(&catalog)));
    let bus = Arc::new(EventBus::default());

    // Stand-in for a UI push channel: mirror observations into the log.
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(seq = event.seq, kind = ?event.kind, "pipeline event"),
                Err(RecvError::Lagged(missed)) => debug!(missed, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = Pipeline::new(config, store)
        .with_observer(bus)
        .start()
        .await?;

    for (worker, addr) in handle.listen_addrs() {
        info!(worker = worker.get(), %addr, "slot ready");
    }

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel.cancel();
    });

    handle.cancel_token().cancelled().await;
    handle.join().await?;

    info!(stored = catalog.len(), "catalog at shutdown");
    Ok(())
}

async fn cmd_send(file: &Path, host: &str, port: u16, content_type: String) -> anyhow::Result<()> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;

    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("video.bin")
        .to_string();

    let metadata = VideoMetadata {
        file_name,
        file_size: i64::try_from(payload.len())?,
        content_type,
        timestamp: Utc::now(),
    };

    let mut stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("cannot connect to {host}:{port}"))?;
    codec::write_frame(&mut stream, &metadata, &payload).await?;

    println!(
        "Sent {} ({} bytes) to {host}:{port}",
        metadata.file_name,
        payload.len()
    );
    Ok(())
}
