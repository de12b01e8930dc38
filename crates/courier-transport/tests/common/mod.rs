//! In-memory collectors for delivery tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::codec::{FrameHeader, FRAME_ACK, FRAME_HEADER_SIZE};
use courier_transport::{
    Batch, CancelToken, Connection, Connector, DeliveryMetrics, DeliveryWorker, Dialer,
    LineEvent, Result, ServerPool, TransportConfig, TransportError, WorkerId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Dialer whose every connection is an in-memory pipe; the collector half of each
/// pipe is handed to the test in dial order.
pub struct PipeDialer {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl PipeDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { peers }), rx)
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<Connection> {
        let (client, server) = tokio::io::duplex(256 * 1024);
        self.peers
            .send(server)
            .map_err(|_| TransportError::IoError(std::io::ErrorKind::ConnectionRefused.into()))?;
        Ok(Connection::new(Box::new(client), addr, timeout))
    }
}

/// One window-plus-payload exchange as the collector saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub window: u32,
    pub wire: Vec<u8>,
}

impl Received {
    /// Compressed payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.wire[2 * FRAME_HEADER_SIZE..]
    }
}

/// Reads one window frame and its payload frame.
pub async fn read_exchange<S: AsyncRead + Unpin>(peer: &mut S) -> std::io::Result<Received> {
    let mut window_frame = [0u8; FRAME_HEADER_SIZE];
    peer.read_exact(&mut window_frame).await?;
    let mut payload_frame = [0u8; FRAME_HEADER_SIZE];
    peer.read_exact(&mut payload_frame).await?;
    let mut payload = vec![0u8; FrameHeader::decode(&payload_frame).value as usize];
    peer.read_exact(&mut payload).await?;

    let mut wire = Vec::with_capacity(2 * FRAME_HEADER_SIZE + payload.len());
    wire.extend_from_slice(&window_frame);
    wire.extend_from_slice(&payload_frame);
    wire.extend_from_slice(&payload);
    Ok(Received {
        window: FrameHeader::decode(&window_frame).value,
        wire,
    })
}

/// Sends a well-formed acknowledgement for `window` events.
pub async fn ack<S: AsyncWrite + Unpin>(peer: &mut S, window: u32) {
    peer.write_all(&FrameHeader::new(FRAME_ACK, window).encode())
        .await
        .unwrap();
}

/// Acknowledges every batch on `peer` until the worker hangs up.
pub async fn ack_all(mut peer: DuplexStream, seen: mpsc::UnboundedSender<Received>) {
    while let Ok(received) = read_exchange(&mut peer).await {
        let window = received.window;
        let _ = seen.send(received);
        ack(&mut peer, window).await;
    }
}

/// Accepts every connection the dialer hands out and acknowledges everything on it.
pub fn spawn_collector(
    mut peers: mpsc::UnboundedReceiver<DuplexStream>,
) -> mpsc::UnboundedReceiver<Received> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            tokio::spawn(ack_all(peer, seen_tx.clone()));
        }
    });
    seen_rx
}

pub fn config() -> TransportConfig {
    TransportConfig::new(vec!["collector-a:5043".to_string(), "collector-b:5043".to_string()])
}

pub fn worker(
    dialer: Arc<dyn Dialer>,
    cancel: CancelToken,
) -> (DeliveryWorker, Arc<DeliveryMetrics>) {
    let config = config();
    let metrics = Arc::new(DeliveryMetrics::new());
    let connector = Connector::with_seed(
        dialer,
        ServerPool::new(config.servers.clone()).unwrap(),
        config.timeout(),
        metrics.clone(),
        42,
    );
    let worker = DeliveryWorker::new(WorkerId(1), connector, &config, metrics.clone(), cancel);
    (worker, metrics)
}

pub fn line(source: &str, offset: u64, text: &str) -> LineEvent {
    LineEvent {
        source: source.to_string(),
        start: offset.saturating_sub(text.len() as u64 + 1),
        offset,
        line: text.to_string(),
        host: "shipper-1".to_string(),
        fields: BTreeMap::new(),
    }
}

pub fn lines(source: &str, texts: &[&str]) -> Batch<LineEvent> {
    let mut offset = 0;
    Batch::new(
        texts
            .iter()
            .map(|text| {
                offset += text.len() as u64 + 1;
                line(source, offset, text)
            })
            .collect(),
    )
}
