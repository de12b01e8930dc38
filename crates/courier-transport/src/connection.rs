//! An authenticated stream to one collector.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{EncodedBatch, ACK_FRAME_SIZE};
use crate::error::{Result, TransportError};

/// Byte stream a [`Connection`] can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned by exactly one worker. Never repaired: on any error the worker drops it
/// and dials a new one, which closes the underlying socket.
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    peer_addr: String,
    timeout: Duration,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Connection {
    /// Wraps an established stream; every operation is bounded by `timeout`.
    pub fn new(stream: Box<dyn AsyncStream>, peer_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream,
            peer_addr: peer_addr.into(),
            timeout,
        }
    }

    /// Address of the collector this connection talks to.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Writes the window-size frame.
    pub async fn send_window(&mut self, batch: &EncodedBatch) -> Result<()> {
        let timeout = self.timeout;
        with_deadline(timeout, "window frame write", async {
            self.stream.write_all(batch.window_frame()).await?;
            self.stream.flush().await
        })
        .await
    }

    /// Writes the compressed-payload frame, header then body.
    pub async fn send_payload(&mut self, batch: &EncodedBatch) -> Result<()> {
        let timeout = self.timeout;
        with_deadline(timeout, "payload frame write", async {
            self.stream.write_all(batch.payload_header()).await?;
            self.stream.write_all(batch.payload()).await?;
            self.stream.flush().await
        })
        .await
    }

    /// Reads exactly one acknowledgement frame, accumulating partial reads.
    pub async fn read_ack(&mut self) -> Result<[u8; ACK_FRAME_SIZE]> {
        let timeout = self.timeout;
        let mut response = [0u8; ACK_FRAME_SIZE];
        with_deadline(timeout, "acknowledgement read", async {
            self.stream.read_exact(&mut response).await.map(|_| ())
        })
        .await?;
        Ok(response)
    }

    /// Shuts the stream down. Errors are ignored; the connection is being discarded.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(self.timeout, self.stream.shutdown()).await;
    }
}

async fn with_deadline<F>(timeout: Duration, operation: &'static str, io: F) -> Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| TransportError::IoTimeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(TransportError::IoError)
}
