//! Error type shared by the transport, the spooler and the registrar.

use thiserror::Error;

/// Failures raised while configuring, connecting or delivering.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configuration or a certificate file can never work.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// TCP connect did not finish in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Collector address.
        addr: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// TLS handshake did not finish in time.
    #[error("TLS handshake with {addr} timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Collector address.
        addr: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// The TLS handshake failed.
    #[error("TLS error: {reason}")]
    TlsError {
        /// Error reported by the TLS stack.
        reason: String,
    },

    /// A frame write or the acknowledgement read did not finish in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    IoTimeout {
        /// The I/O step that timed out.
        operation: &'static str,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// The acknowledgement did not match the batch.
    #[error("invalid acknowledgement: {reason}")]
    InvalidAck {
        /// How it differed.
        reason: String,
    },

    /// A batch or the registrar state could not be serialized.
    #[error("failed to encode batch: {reason}")]
    Encode {
        /// What failed.
        reason: String,
    },

    /// The registrar stopped receiving.
    #[error("registrar channel closed")]
    RegistrarClosed,

    /// Cancellation was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker task ended abnormally.
    #[error("worker {worker} failed: {reason}")]
    WorkerFailed {
        /// Worker id.
        worker: u32,
        /// Panic or join error text.
        reason: String,
    },

    /// Socket or file I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the failure is recovered by dropping the connection and
    /// reconnecting. Everything else ends the worker or the process.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionTimeout { .. }
                | TransportError::HandshakeTimeout { .. }
                | TransportError::TlsError { .. }
                | TransportError::IoTimeout { .. }
                | TransportError::InvalidAck { .. }
                | TransportError::IoError(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
