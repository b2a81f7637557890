//! Typed pipeline configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional TOML file,
//! `VIDQ_*` environment variables, then whatever the caller overrides (the
//! CLI flags). Loaded once at startup and immutable afterwards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::FrameLimits;
use crate::error::{Error, Result};
use crate::model::WorkerId;

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker slots. Each slot gets one listener and one worker.
    pub worker_count: u32,
    /// Maximum number of queued items before new arrivals are dropped.
    pub queue_capacity: usize,
    /// Port of slot 1; slot `n` listens on `base_port + n - 1`.
    /// 0 gives every slot an OS-assigned port.
    pub base_port: u16,
    pub bind_host: IpAddr,
    pub storage_dir: PathBuf,
    /// Longest a worker waits on an empty queue before re-checking.
    pub poll_interval: Duration,
    /// Fixed part of the simulated processing latency.
    pub processing_delay: Duration,
    /// Upper bound of the per-item extra latency.
    pub processing_jitter: Duration,
    /// Deadline for reading one frame off a connection.
    pub read_timeout: Duration,
    /// How long an in-progress store may run on after shutdown is signalled.
    pub store_grace: Duration,
    pub limits: FrameLimits,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 10,
            base_port: 9000,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            storage_dir: PathBuf::from("VideoStorage"),
            poll_interval: Duration::from_secs(1),
            processing_delay: Duration::from_secs(10),
            processing_jitter: Duration::from_secs(2),
            read_timeout: Duration::from_secs(30),
            store_grace: Duration::from_secs(5),
            limits: FrameLimits::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    pipeline: PipelineSection,
    #[serde(default)]
    telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSection {
    workers: Option<u32>,
    queue_capacity: Option<usize>,
    base_port: Option<u16>,
    bind_host: Option<IpAddr>,
    storage_dir: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    processing_delay_ms: Option<u64>,
    processing_jitter_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    store_grace_ms: Option<u64>,
    max_metadata_bytes: Option<usize>,
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TelemetrySection {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Defaults overlaid with environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults, then the TOML file at `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
            config.apply_toml(&content).map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
                other => other,
            })?;
        }
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay settings from a TOML document.
    pub fn apply_toml(&mut self, content: &str) -> Result<()> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))?;

        let p = file.pipeline;
        set(&mut self.worker_count, p.workers);
        set(&mut self.queue_capacity, p.queue_capacity);
        set(&mut self.base_port, p.base_port);
        set(&mut self.bind_host, p.bind_host);
        set(&mut self.storage_dir, p.storage_dir);
        set(&mut self.poll_interval, p.poll_interval_ms.map(Duration::from_millis));
        set(&mut self.processing_delay, p.processing_delay_ms.map(Duration::from_millis));
        set(&mut self.processing_jitter, p.processing_jitter_ms.map(Duration::from_millis));
        set(&mut self.read_timeout, p.read_timeout_ms.map(Duration::from_millis));
        set(&mut self.store_grace, p.store_grace_ms.map(Duration::from_millis));
        set(&mut self.limits.max_metadata_bytes, p.max_metadata_bytes);
        set(&mut self.limits.max_payload_bytes, p.max_payload_bytes);

        if file.telemetry.otel_endpoint.is_some() {
            self.otel_endpoint = file.telemetry.otel_endpoint;
        }
        set(&mut self.log_level, file.telemetry.log_level);
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        set(&mut self.worker_count, parsed_var("VIDQ_WORKERS")?);
        set(&mut self.queue_capacity, parsed_var("VIDQ_QUEUE_CAPACITY")?);
        set(&mut self.base_port, parsed_var("VIDQ_BASE_PORT")?);
        set(&mut self.bind_host, parsed_var("VIDQ_BIND_HOST")?);
        set(&mut self.storage_dir, parsed_var("VIDQ_STORAGE_DIR")?);
        set(
            &mut self.poll_interval,
            parsed_var("VIDQ_POLL_INTERVAL_MS")?.map(Duration::from_millis),
        );
        set(
            &mut self.processing_delay,
            parsed_var("VIDQ_PROCESSING_DELAY_MS")?.map(Duration::from_millis),
        );
        set(
            &mut self.processing_jitter,
            parsed_var("VIDQ_PROCESSING_JITTER_MS")?.map(Duration::from_millis),
        );
        set(
            &mut self.store_grace,
            parsed_var("VIDQ_STORE_GRACE_MS")?.map(Duration::from_millis),
        );
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        set(&mut self.log_level, std::env::var("LOG_LEVEL").ok());
        Ok(())
    }

    /// Reject settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".to_string()));
        }
        // One listening port per slot.
        if self.worker_count > u32::from(u16::MAX) {
            return Err(Error::Config(format!(
                "worker count {} exceeds the {} available ports",
                self.worker_count,
                u16::MAX
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        if self.base_port != 0 {
            let last = u16::try_from(self.worker_count - 1)
                .ok()
                .and_then(|offset| self.base_port.checked_add(offset));
            if last.is_none() {
                return Err(Error::Config(format!(
                    "{} workers from base port {} runs past port {}",
                    self.worker_count,
                    self.base_port,
                    u16::MAX
                )));
            }
        }
        Ok(())
    }

    /// Address the listener for `worker` binds to.
    ///
    /// Assumes [`validate`](Self::validate) passed.
    pub fn listen_addr(&self, worker: WorkerId) -> SocketAddr {
        let port = if self.base_port == 0 {
            0
        } else {
            // validate() guarantees the sum fits.
            self.base_port.saturating_add(worker.offset() as u16)
        };
        SocketAddr::new(self.bind_host, port)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
