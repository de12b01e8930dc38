//! Transport configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default zlib level for payload compression. Low levels favour throughput.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

/// Immutable settings shared by every delivery worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Collector addresses as `host:port`. One is picked at random per connection attempt.
    pub servers: Vec<String>,
    /// Bound applied to connect, TLS handshake, each frame write and the acknowledgement read.
    pub timeout_secs: u64,
    /// PEM client certificate presented to the collector.
    pub ssl_certificate: Option<PathBuf>,
    /// PEM private key matching `ssl_certificate`.
    pub ssl_key: Option<PathBuf>,
    /// PEM file holding exactly one trusted CA certificate. The bundled web PKI
    /// roots are trusted when unset.
    pub ssl_ca: Option<PathBuf>,
    /// zlib level (0-9) for the compressed payload frame.
    pub compression_level: u32,
    /// Verify the acknowledgement's frame type and sequence instead of only its length.
    pub strict_ack: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout_secs: 15,
            ssl_certificate: None,
            ssl_key: None,
            ssl_ca: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            strict_ack: true,
        }
    }
}

impl TransportConfig {
    /// Creates a configuration for the given servers with default settings.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    /// Loads a configuration from a `.toml` or `.json` file and validates it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: TransportConfig = load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// The per-operation network timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rejects configurations that can never work. None of these are retryable.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(config_error("server list must not be empty"));
        }
        if let Some(addr) = self.servers.iter().find(|s| s.rsplit_once(':').is_none()) {
            return Err(config_error(format!("server address {addr} is missing a port")));
        }
        if self.timeout_secs == 0 {
            return Err(config_error("timeout_secs must be greater than zero"));
        }
        match (&self.ssl_certificate, &self.ssl_key) {
            (Some(_), None) => {
                return Err(config_error("ssl_certificate is set but ssl_key is not"))
            }
            (None, Some(_)) => {
                return Err(config_error("ssl_key is set but ssl_certificate is not"))
            }
            _ => {}
        }
        if self.compression_level > 9 {
            return Err(config_error(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Settings of the `courier` binary: what to read and how to feed the workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    /// Delivery settings.
    pub transport: TransportConfig,
    /// Number of concurrent delivery workers.
    pub workers: usize,
    /// Maximum events per batch.
    pub spool_size: usize,
    /// Flush a partial batch after this many milliseconds without new lines.
    pub idle_flush_ms: u64,
    /// File to ship. Standard input when unset.
    pub source: Option<PathBuf>,
    /// Host name stamped on every event.
    pub host: Option<String>,
    /// Static fields attached to every event.
    pub fields: BTreeMap<String, String>,
    /// Where acknowledged offsets are persisted.
    pub state_file: Option<PathBuf>,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            workers: 1,
            spool_size: 1024,
            idle_flush_ms: 5000,
            source: None,
            host: None,
            fields: BTreeMap::new(),
            state_file: None,
        }
    }
}

impl ShipperConfig {
    /// Loads a configuration from a `.toml` or `.json` file and validates it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: ShipperConfig = load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Idle interval after which a partial batch is flushed.
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    /// Validates the transport section and the spooling limits.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.workers == 0 {
            return Err(config_error("workers must be at least 1"));
        }
        if self.spool_size == 0 {
            return Err(config_error("spool_size must be at least 1"));
        }
        if self.idle_flush_ms == 0 {
            return Err(config_error("idle_flush_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Reads any serde-deserializable config, picking the format from the file extension.
pub fn load_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path).map_err(|e| {
        config_error(format!("failed to read {}: {}", path.display(), e))
    })?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => toml::from_str(&contents)
            .map_err(|e| config_error(format!("invalid TOML in {}: {}", path.display(), e))),
        "json" => serde_json::from_str(&contents)
            .map_err(|e| config_error(format!("invalid JSON in {}: {}", path.display(), e))),
        _ => Err(config_error(format!("unsupported config file extension: {ext}"))),
    }
}

fn config_error(reason: impl Into<String>) -> TransportError {
    TransportError::Config {
        reason: reason.into(),
    }
}
