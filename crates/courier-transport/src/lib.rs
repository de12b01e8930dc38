#![warn(missing_docs)]

//! Courier transport: at-least-once delivery of event batches to log collectors over
//! TLS, with windowed compressed framing, acknowledgement tracking and a pool of
//! symmetric reconnecting workers.

pub mod batch;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pool;
pub mod registrar;
pub mod spool;
pub mod tls;
pub mod worker;

pub use batch::Batch;
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use codec::{BatchEncoder, EncodedBatch, Event};
pub use config::{ShipperConfig, TransportConfig};
pub use connection::Connection;
pub use connector::{Connector, Dialer, ServerPool, TlsDialer, RECONNECT_BACKOFF};
pub use error::{Result, TransportError};
pub use event::LineEvent;
pub use metrics::{DeliveryMetrics, MetricsSnapshot};
pub use pool::WorkerPool;
pub use registrar::{Registrar, RegistrarState};
pub use spool::Spooler;
pub use worker::{DeliveryWorker, WorkerExit, WorkerId};
