//! Delivery metrics shared by all workers of a pool.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of delivery metrics at a point in time.
pub struct MetricsSnapshot {
    /// Dial attempts, successful or not.
    pub connect_attempts: u64,
    /// Dial attempts that failed (TCP connect or TLS handshake).
    pub connect_failures: u64,
    /// Connections dropped mid-exchange and replaced.
    pub reconnects: u64,
    /// Window plus payload transmissions, including retries.
    pub batches_sent: u64,
    /// Batches acknowledged and forwarded to the registrar.
    pub batches_acked: u64,
    /// Events inside acknowledged batches.
    pub events_acked: u64,
    /// Frame bytes written, including retries.
    pub bytes_sent: u64,
    /// Acknowledgements that failed verification.
    pub ack_rejections: u64,
}

/// Thread-safe delivery metrics collector.
#[derive(Default)]
pub struct DeliveryMetrics {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    batches_sent: AtomicU64,
    batches_acked: AtomicU64,
    events_acked: AtomicU64,
    bytes_sent: AtomicU64,
    ack_rejections: AtomicU64,
}

impl std::fmt::Debug for DeliveryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl DeliveryMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self, events: usize) {
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
        self.events_acked.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_rejection(&self) {
        self.ack_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ack_rejections: self.ack_rejections.load(Ordering::Relaxed),
        }
    }
}
