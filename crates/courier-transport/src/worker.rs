//! The delivery worker: one connection, one batch in flight.
//!
//! Per batch the worker moves through
//!
//! ```text
//! ENCODING -> SENDING_WINDOW -> SENDING_PAYLOAD -> AWAITING_ACK -> ACKED
//!                   ^                                    |
//!                   +------------ RECONNECTING <---------+ (any failure)
//! ```
//!
//! There is no failed state. A batch is encoded once and the same bytes are resent
//! on every new connection until a collector acknowledges them; only then is the
//! batch handed to the registrar.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::batch::Batch;
use crate::cancel::CancelToken;
use crate::codec::{AckFrame, BatchEncoder, EncodedBatch, Event};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::connector::{backoff, Connector};
use crate::error::{Result, TransportError};
use crate::metrics::DeliveryMetrics;

/// Diagnostic identity of a worker. Not part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input channel shared by every worker of a pool. Whichever idle worker holds the
/// lock takes the next batch.
pub type SharedReceiver<E> = Arc<Mutex<mpsc::Receiver<Batch<E>>>>;

/// Why a worker stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The input channel was closed and drained.
    Drained,
    /// Cancellation was requested. Any batch in flight was not forwarded.
    Cancelled,
}

/// Step of the send-and-acknowledge exchange that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SendingWindow,
    SendingPayload,
    AwaitingAck,
}

/// Pulls batches, ships them and reports acknowledged ones to the registrar.
pub struct DeliveryWorker {
    id: WorkerId,
    connector: Connector,
    encoder: BatchEncoder,
    strict_ack: bool,
    metrics: Arc<DeliveryMetrics>,
    cancel: CancelToken,
}

impl fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("id", &self.id)
            .field("strict_ack", &self.strict_ack)
            .finish()
    }
}

impl DeliveryWorker {
    /// Creates a worker; compression level and acknowledgement checking come from `config`.
    pub fn new(
        id: WorkerId,
        connector: Connector,
        config: &TransportConfig,
        metrics: Arc<DeliveryMetrics>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            connector,
            encoder: BatchEncoder::new(config.compression_level),
            strict_ack: config.strict_ack,
            metrics,
            cancel,
        }
    }

    /// This worker's identity.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Runs until the input is drained or cancellation is requested.
    ///
    /// Errors are limited to conditions no reconnect can fix: an event that fails
    /// to serialize, or a registrar that went away.
    pub async fn run<E: Event>(
        mut self,
        input: SharedReceiver<E>,
        registrar: mpsc::Sender<Batch<E>>,
    ) -> Result<WorkerExit> {
        let mut conn = match self.connector.connect(self.id, &self.cancel).await {
            Ok(conn) => conn,
            Err(TransportError::Cancelled) => return Ok(self.finish(WorkerExit::Cancelled)),
            Err(e) => return Err(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                batch = receive(&input) => Some(batch),
            };
            let batch = match next {
                None => {
                    conn.close().await;
                    return Ok(self.finish(WorkerExit::Cancelled));
                }
                Some(None) => {
                    conn.close().await;
                    return Ok(self.finish(WorkerExit::Drained));
                }
                Some(Some(batch)) => batch,
            };

            conn = match self.deliver(conn, &batch).await {
                Ok(conn) => conn,
                Err(TransportError::Cancelled) => return Ok(self.finish(WorkerExit::Cancelled)),
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "worker stopping");
                    return Err(e);
                }
            };

            self.metrics.record_acked(batch.len());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    conn.close().await;
                    return Ok(self.finish(WorkerExit::Cancelled));
                }
                sent = registrar.send(batch) => {
                    if sent.is_err() {
                        conn.close().await;
                        return Err(TransportError::RegistrarClosed);
                    }
                }
            }
        }
    }

    /// Ships one batch, replacing the connection as often as needed. Returns the
    /// connection that carried the acknowledged exchange.
    async fn deliver<E: Event>(&mut self, mut conn: Connection, batch: &Batch<E>) -> Result<Connection> {
        if batch.is_empty() {
            return Ok(conn);
        }
        let encoded = self.encoder.encode(batch.events())?;

        loop {
            match self.exchange(&mut conn, &encoded).await {
                Ok(()) => {
                    tracing::debug!(
                        worker = %self.id,
                        server = %conn.peer_addr(),
                        events = encoded.window(),
                        bytes = encoded.payload().len(),
                        "batch acknowledged"
                    );
                    return Ok(conn);
                }
                Err((phase, e)) => {
                    if !e.is_transient() {
                        return Err(e);
                    }
                    if matches!(e, TransportError::InvalidAck { .. }) {
                        self.metrics.record_ack_rejection();
                    }
                    tracing::warn!(
                        worker = %self.id,
                        server = %conn.peer_addr(),
                        phase = ?phase,
                        error = %e,
                        "socket error, will reconnect"
                    );
                    self.metrics.record_reconnect();
                    drop(conn);
                    backoff(&self.cancel).await?;
                    conn = self.connector.connect(self.id, &self.cancel).await?;
                }
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut Connection,
        batch: &EncodedBatch,
    ) -> std::result::Result<(), (Phase, TransportError)> {
        conn.send_window(batch)
            .await
            .map_err(|e| (Phase::SendingWindow, e))?;
        conn.send_payload(batch)
            .await
            .map_err(|e| (Phase::SendingPayload, e))?;
        self.metrics.record_sent(batch.wire_len());

        let ack = conn.read_ack().await.map_err(|e| (Phase::AwaitingAck, e))?;
        if self.strict_ack {
            AckFrame::decode(&ack)
                .verify(batch.window())
                .map_err(|e| (Phase::AwaitingAck, e))?;
        }
        Ok(())
    }

    fn finish(&self, exit: WorkerExit) -> WorkerExit {
        tracing::info!(worker = %self.id, exit = ?exit, "worker done");
        exit
    }
}

async fn receive<E>(input: &SharedReceiver<E>) -> Option<Batch<E>> {
    input.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use crate::codec::{FrameHeader, ACK_FRAME_SIZE, FRAME_ACK, FRAME_HEADER_SIZE};
    use crate::connector::{Dialer, ServerPool};
    use async_trait::async_trait;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Debug, Clone, PartialEq)]
    struct Msg(u8);

    impl Event for Msg {
        fn serialize(&self, sequence: u32, sink: &mut dyn Write) -> std::io::Result<()> {
            sink.write_all(&sequence.to_be_bytes())?;
            sink.write_all(&[self.0])
        }
    }

    struct Fails;

    impl Event for Fails {
        fn serialize(&self, _sequence: u32, _sink: &mut dyn Write) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }
    }

    /// Hands each dialed connection's server half to the test.
    struct ChannelDialer {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Dialer for ChannelDialer {
        async fn dial(&self, addr: &str, timeout: Duration) -> Result<Connection> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.peers
                .send(server)
                .map_err(|_| TransportError::IoError(std::io::ErrorKind::ConnectionRefused.into()))?;
            Ok(Connection::new(Box::new(client), addr, timeout))
        }
    }

    fn worker(
        strict_ack: bool,
        cancel: CancelToken,
    ) -> (DeliveryWorker, mpsc::UnboundedReceiver<DuplexStream>, Arc<DeliveryMetrics>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(DeliveryMetrics::new());
        let connector = Connector::with_seed(
            Arc::new(ChannelDialer { peers: tx }),
            ServerPool::new(vec!["collector:5043".to_string()]).unwrap(),
            Duration::from_secs(5),
            metrics.clone(),
            1,
        );
        let config = TransportConfig {
            strict_ack,
            ..TransportConfig::default()
        };
        (
            DeliveryWorker::new(WorkerId(7), connector, &config, metrics.clone(), cancel),
            rx,
            metrics,
        )
    }

    async fn read_batch(peer: &mut DuplexStream) -> u32 {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        peer.read_exact(&mut header).await.unwrap();
        let window = FrameHeader::decode(&header).value;
        peer.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; FrameHeader::decode(&header).value as usize];
        peer.read_exact(&mut payload).await.unwrap();
        window
    }

    fn channels<E>() -> (
        mpsc::Sender<Batch<E>>,
        SharedReceiver<E>,
        mpsc::Sender<Batch<E>>,
        mpsc::Receiver<Batch<E>>,
    ) {
        let (input_tx, input_rx) = mpsc::channel(8);
        let (registrar_tx, registrar_rx) = mpsc::channel(8);
        (input_tx, Arc::new(Mutex::new(input_rx)), registrar_tx, registrar_rx)
    }

    #[tokio::test]
    async fn test_worker_drains_and_forwards() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, mut peers, metrics) = worker(true, cancel);
        let (input_tx, input, registrar_tx, mut registrar_rx) = channels();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![Msg(1), Msg(2)])).await.unwrap();
        drop(input_tx);

        let mut peer = peers.recv().await.unwrap();
        let window = read_batch(&mut peer).await;
        peer.write_all(&FrameHeader::new(FRAME_ACK, window).encode())
            .await
            .unwrap();

        assert_eq!(registrar_rx.recv().await.unwrap().events(), &[Msg(1), Msg(2)]);
        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Drained);
        assert_eq!(metrics.snapshot().reconnects, 0);
        assert_eq!(metrics.snapshot().events_acked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_ack_reconnects_in_strict_mode() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, mut peers, metrics) = worker(true, cancel);
        let (input_tx, input, registrar_tx, mut registrar_rx) = channels();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![Msg(9)])).await.unwrap();
        drop(input_tx);

        let mut first = peers.recv().await.unwrap();
        read_batch(&mut first).await;
        first.write_all(&[0u8; ACK_FRAME_SIZE]).await.unwrap();

        let mut second = peers.recv().await.unwrap();
        let window = read_batch(&mut second).await;
        second
            .write_all(&FrameHeader::new(FRAME_ACK, window).encode())
            .await
            .unwrap();

        assert_eq!(registrar_rx.recv().await.unwrap().len(), 1);
        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Drained);
        let snap = metrics.snapshot();
        assert_eq!(snap.ack_rejections, 1);
        assert_eq!(snap.reconnects, 1);
    }

    #[tokio::test]
    async fn test_any_six_bytes_accepted_when_not_strict() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, mut peers, metrics) = worker(false, cancel);
        let (input_tx, input, registrar_tx, mut registrar_rx) = channels();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![Msg(1)])).await.unwrap();
        drop(input_tx);

        let mut peer = peers.recv().await.unwrap();
        read_batch(&mut peer).await;
        peer.write_all(&[0u8; ACK_FRAME_SIZE]).await.unwrap();

        assert_eq!(registrar_rx.recv().await.unwrap().len(), 1);
        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Drained);
        assert_eq!(metrics.snapshot().reconnects, 0);
    }

    #[tokio::test]
    async fn test_empty_batch_forwarded_without_traffic() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, mut peers, metrics) = worker(true, cancel);
        let (input_tx, input, registrar_tx, mut registrar_rx) = channels::<Msg>();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![])).await.unwrap();
        drop(input_tx);

        let mut peer = peers.recv().await.unwrap();
        assert!(registrar_rx.recv().await.unwrap().is_empty());
        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Drained);

        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(metrics.snapshot().batches_sent, 0);
    }

    #[tokio::test]
    async fn test_serialization_failure_stops_worker() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, _peers, _metrics) = worker(true, cancel);
        let (input_tx, input, registrar_tx, mut registrar_rx) = channels();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![Fails])).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Encode { .. }));
        assert!(registrar_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registrar_gone_is_error() {
        let (cancel, _handle) = new_cancel_pair();
        let (worker, mut peers, _metrics) = worker(true, cancel);
        let (input_tx, input, registrar_tx, registrar_rx) = channels();
        drop(registrar_rx);

        let task = tokio::spawn(worker.run(input, registrar_tx));
        input_tx.send(Batch::new(vec![Msg(1)])).await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        let window = read_batch(&mut peer).await;
        peer.write_all(&FrameHeader::new(FRAME_ACK, window).encode())
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::RegistrarClosed));
    }

    #[tokio::test]
    async fn test_cancel_while_idle() {
        let (cancel, handle) = new_cancel_pair();
        let (worker, _peers, _metrics) = worker(true, cancel);
        let (_input_tx, input, registrar_tx, _registrar_rx) = channels::<Msg>();

        let task = tokio::spawn(worker.run(input, registrar_tx));
        tokio::task::yield_now().await;
        handle.cancel(CancelReason::Shutdown);

        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Cancelled);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "3");
    }
}
