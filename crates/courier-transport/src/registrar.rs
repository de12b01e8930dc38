//! Bookkeeping of acknowledged read positions.
//!
//! Receipt of a batch on the registrar channel is the durability signal: only then
//! may the read position of its source advance. Workers can forward batches out of
//! order, so the registrar only moves a source's offset across the contiguous
//! acknowledged prefix. Spans acknowledged beyond a gap wait until the gap closes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::batch::Batch;
use crate::error::{Result, TransportError};
use crate::event::LineEvent;

/// Acknowledged offset per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarState {
    /// Byte offset up to which every line was acknowledged, keyed by source.
    pub offsets: BTreeMap<String, u64>,
    /// Acknowledged `start -> end` spans not yet adjacent to the offset.
    #[serde(skip)]
    pending: BTreeMap<String, BTreeMap<u64, u64>>,
}

impl RegistrarState {
    /// Applies an acknowledged batch; returns whether any offset advanced.
    pub fn record(&mut self, batch: &Batch<LineEvent>) -> bool {
        let mut spans: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for event in batch.events() {
            let span = spans
                .entry(event.source.as_str())
                .or_insert((event.start, event.offset));
            span.0 = span.0.min(event.start);
            span.1 = span.1.max(event.offset);
        }

        let mut advanced = false;
        for (source, (start, end)) in spans {
            advanced |= self.acknowledge(source, start, end);
        }
        advanced
    }

    /// Sets the position reading resumes from and forgets spans pending for `source`.
    pub fn start_at(&mut self, source: &str, offset: u64) {
        self.offsets.insert(source.to_string(), offset);
        self.pending.remove(source);
    }

    /// Acknowledged offset for `source`, if it is known.
    pub fn offset(&self, source: &str) -> Option<u64> {
        self.offsets.get(source).copied()
    }

    /// Number of acknowledged spans for `source` still waiting on a gap.
    pub fn pending_spans(&self, source: &str) -> usize {
        self.pending.get(source).map_or(0, BTreeMap::len)
    }

    fn acknowledge(&mut self, source: &str, start: u64, end: u64) -> bool {
        let acked = self.offset(source).unwrap_or(0);
        if end <= acked {
            return false;
        }

        let pending = self.pending.entry(source.to_string()).or_default();
        let slot = pending.entry(start.max(acked)).or_insert(end);
        *slot = (*slot).max(end);

        let mut cursor = acked;
        while let Some((&span_start, &span_end)) = pending.first_key_value() {
            if span_start > cursor {
                break;
            }
            pending.pop_first();
            cursor = cursor.max(span_end);
        }
        if pending.is_empty() {
            self.pending.remove(source);
        }

        if cursor > acked {
            self.offsets.insert(source.to_string(), cursor);
            true
        } else {
            false
        }
    }
}

/// Consumes acknowledged batches and optionally persists offsets as JSON.
#[derive(Debug, Default)]
pub struct Registrar {
    state_file: Option<PathBuf>,
    state: RegistrarState,
}

impl Registrar {
    /// Creates a registrar; `state_file` is loaded if it exists and rewritten
    /// whenever an offset advances.
    pub fn new(state_file: Option<PathBuf>) -> Result<Self> {
        let state = match &state_file {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)?;
                serde_json::from_str(&contents).map_err(|e| TransportError::Config {
                    reason: format!("invalid registrar state in {}: {}", path.display(), e),
                })?
            }
            _ => RegistrarState::default(),
        };
        Ok(Self { state_file, state })
    }

    /// Current state.
    pub fn state(&self) -> &RegistrarState {
        &self.state
    }

    /// Declares where reading of `source` resumes.
    pub fn start_at(&mut self, source: &str, offset: u64) {
        self.state.start_at(source, offset);
    }

    /// Runs until every sender is dropped and returns the final state.
    pub async fn run(mut self, mut acked: mpsc::Receiver<Batch<LineEvent>>) -> Result<RegistrarState> {
        while let Some(batch) = acked.recv().await {
            if self.state.record(&batch) {
                tracing::debug!(events = batch.len(), "registrar advanced");
                self.persist().await?;
            }
        }
        for (source, offset) in &self.state.offsets {
            let pending = self.state.pending_spans(source);
            if pending > 0 {
                tracing::warn!(source = %source, offset, pending, "acknowledged spans beyond a gap were not recorded");
            }
            tracing::info!(source = %source, offset, "acknowledged position");
        }
        Ok(self.state)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.state).map_err(|e| TransportError::Encode {
            reason: format!("failed to serialize registrar state: {e}"),
        })?;
        let tmp = path.with_extension("new");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
