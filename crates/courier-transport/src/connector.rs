//! Establishing connections to a random member of the collector pool.
//!
//! [`Connector::connect`] does not give up: an unreachable pool stalls the worker
//! rather than failing a batch, since there is nothing sensible to do with a batch
//! that cannot be delivered. Each attempt picks a server independently at random;
//! failed servers are not skipped. Cancellation is the only way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cancel::CancelToken;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::metrics::DeliveryMetrics;
use crate::tls::TlsConnector;
use crate::worker::WorkerId;

/// Fixed pause after any connection failure before the next attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Opens an authenticated connection to one address.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connects to `addr`, bounding each phase by `timeout`.
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<Connection>;
}

/// TCP plus TLS client handshake.
#[derive(Debug, Clone)]
pub struct TlsDialer {
    tls: TlsConnector,
    nodelay: bool,
}

impl TlsDialer {
    /// Creates a dialer using an already-built TLS context.
    pub fn new(tls: TlsConnector) -> Self {
        Self { tls, nodelay: true }
    }

    /// Builds the TLS context from configuration. Errors here are fatal.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Ok(Self::new(TlsConnector::from_config(config)?))
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<Connection> {
        let timeout_ms = timeout.as_millis() as u64;
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms,
            })?
            .map_err(TransportError::IoError)?;

        if self.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }

        let tls_stream = tokio::time::timeout(timeout, self.tls.connect(addr, stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout {
                addr: addr.to_string(),
                timeout_ms,
            })??;

        tracing::debug!(addr = addr, "TLS-TCP connected");
        Ok(Connection::new(Box::new(tls_stream), addr, timeout))
    }
}

/// Non-empty, read-only list of collector addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPool {
    servers: Arc<[String]>,
}

impl ServerPool {
    /// Creates a pool; an empty list is a configuration error.
    pub fn new(servers: Vec<String>) -> Result<Self> {
        if servers.is_empty() {
            return Err(TransportError::Config {
                reason: "server list must not be empty".to_string(),
            });
        }
        Ok(Self {
            servers: servers.into(),
        })
    }

    /// Picks a server uniformly at random.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.servers[rng.gen_range(0..self.servers.len())]
    }

    /// Number of servers in the pool.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Never true for a constructed pool.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// The configured addresses in order.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }
}

/// Per-worker connection factory. Owns its random source so workers pick servers
/// independently.
pub struct Connector {
    dialer: Arc<dyn Dialer>,
    pool: ServerPool,
    timeout: Duration,
    rng: StdRng,
    metrics: Arc<DeliveryMetrics>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Connector {
    /// Creates a connector seeded from OS entropy.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        pool: ServerPool,
        timeout: Duration,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self::with_rng(dialer, pool, timeout, metrics, StdRng::from_entropy())
    }

    /// Creates a connector with a deterministic server selection sequence.
    pub fn with_seed(
        dialer: Arc<dyn Dialer>,
        pool: ServerPool,
        timeout: Duration,
        metrics: Arc<DeliveryMetrics>,
        seed: u64,
    ) -> Self {
        Self::with_rng(dialer, pool, timeout, metrics, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        dialer: Arc<dyn Dialer>,
        pool: ServerPool,
        timeout: Duration,
        metrics: Arc<DeliveryMetrics>,
        rng: StdRng,
    ) -> Self {
        Self {
            dialer,
            pool,
            timeout,
            rng,
            metrics,
        }
    }

    /// Dials random pool members until one accepts, pausing [`RECONNECT_BACKOFF`]
    /// after each failure. Returns early only with [`TransportError::Cancelled`] or
    /// a non-transient error from the dialer.
    pub async fn connect(&mut self, worker: WorkerId, cancel: &CancelToken) -> Result<Connection> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let address = self.pool.pick(&mut self.rng).to_string();
            tracing::info!(worker = %worker, server = %address, "connecting");
            self.metrics.record_connect_attempt();

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                attempt = self.dialer.dial(&address, self.timeout) => attempt,
            };

            match attempt {
                Ok(conn) => {
                    tracing::info!(worker = %worker, server = %address, "connected");
                    return Ok(conn);
                }
                Err(e) if e.is_transient() => {
                    self.metrics.record_connect_failure();
                    tracing::warn!(
                        worker = %worker,
                        server = %address,
                        error = %e,
                        "failed to connect, will retry"
                    );
                    backoff(cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleeps for [`RECONNECT_BACKOFF`] unless cancelled first.
pub async fn backoff(cancel: &CancelToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => Ok(()),
    }
}
