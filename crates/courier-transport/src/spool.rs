//! Groups lines read from a source into batches for the worker pool.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::batch::Batch;
use crate::cancel::CancelToken;
use crate::error::{Result, TransportError};
use crate::event::LineEvent;

/// Turns a byte stream into batches of [`LineEvent`]s.
///
/// A batch is emitted when it reaches `spool_size` events, when no new line has
/// arrived for `idle_flush`, and at end of input.
#[derive(Debug, Clone)]
pub struct Spooler {
    source: String,
    host: String,
    fields: BTreeMap<String, String>,
    spool_size: usize,
    idle_flush: Duration,
}

impl Spooler {
    /// Creates a spooler labelling events with `source` and `host`.
    pub fn new(source: impl Into<String>, host: impl Into<String>, spool_size: usize, idle_flush: Duration) -> Self {
        Self {
            source: source.into(),
            host: host.into(),
            fields: BTreeMap::new(),
            spool_size: spool_size.max(1),
            idle_flush,
        }
    }

    /// Attaches static fields to every event.
    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }

    /// Reads until end of input or cancellation, starting at `offset`, and
    /// returns the offset just past the last line read.
    pub async fn run<R>(
        self,
        mut reader: R,
        mut offset: u64,
        output: mpsc::Sender<Batch<LineEvent>>,
        cancel: CancelToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut pending = Vec::with_capacity(self.spool_size);

        loop {
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let raw = buf.split_to(pos + 1);
                offset += raw.len() as u64;
                pending.push(self.event(&raw, offset));
                if pending.len() >= self.spool_size {
                    self.flush(&mut pending, &output).await?;
                }
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(offset),
                read = reader.read_buf(&mut buf) => read?,
                _ = tokio::time::sleep(self.idle_flush), if !pending.is_empty() => {
                    self.flush(&mut pending, &output).await?;
                    continue;
                }
            };

            if read == 0 {
                if !buf.is_empty() {
                    let raw = buf.split();
                    offset += raw.len() as u64;
                    pending.push(self.event(&raw, offset));
                }
                self.flush(&mut pending, &output).await?;
                tracing::info!(source = %self.source, offset, "end of input");
                return Ok(offset);
            }
        }
    }

    fn event(&self, raw: &[u8], offset: u64) -> LineEvent {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        LineEvent {
            source: self.source.clone(),
            start: offset - raw.len() as u64,
            offset,
            line: String::from_utf8_lossy(line).into_owned(),
            host: self.host.clone(),
            fields: self.fields.clone(),
        }
    }

    async fn flush(
        &self,
        pending: &mut Vec<LineEvent>,
        output: &mpsc::Sender<Batch<LineEvent>>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let events = std::mem::replace(pending, Vec::with_capacity(self.spool_size));
        tracing::debug!(source = %self.source, events = events.len(), "flushing batch");
        output
            .send(Batch::new(events))
            .await
            .map_err(|_| TransportError::Cancelled)
    }
}
