//! Line events and their data sub-frame.
//!
//! The transport treats events as opaque; this is the event model the `courier`
//! binary ships. Each event becomes one data frame inside the compressed payload:
//!
//! ```text
//! '1' 'D' | u32 BE sequence | u32 BE pair count | (u32 BE len, key, u32 BE len, value)*
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::codec::{Event, PROTOCOL_VERSION};
use crate::error::{Result, TransportError};

/// Frame type of a single event inside the compressed payload.
pub const FRAME_DATA: u8 = b'D';

/// One line read from a source, with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    /// Name of the source the line was read from.
    pub source: String,
    /// Byte offset where this line starts in the source.
    pub start: u64,
    /// Byte offset just past this line in the source.
    pub offset: u64,
    /// Line contents without the trailing newline.
    pub line: String,
    /// Host the line was collected on.
    pub host: String,
    /// Extra static fields attached to every event.
    pub fields: BTreeMap<String, String>,
}

impl LineEvent {
    /// Key/value pairs in wire order.
    fn pairs(&self) -> impl Iterator<Item = (&str, Cow<'_, str>)> {
        let fixed: [(&str, Cow<'_, str>); 4] = [
            ("file", Cow::Borrowed(&self.source)),
            ("host", Cow::Borrowed(&self.host)),
            ("offset", Cow::Owned(self.offset.to_string())),
            ("line", Cow::Borrowed(&self.line)),
        ];
        fixed.into_iter().chain(
            self.fields
                .iter()
                .map(|(k, v)| (k.as_str(), Cow::Borrowed(v.as_str()))),
        )
    }
}

impl Event for LineEvent {
    fn serialize(&self, sequence: u32, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&[PROTOCOL_VERSION, FRAME_DATA])?;
        sink.write_all(&sequence.to_be_bytes())?;
        sink.write_all(&(4 + self.fields.len() as u32).to_be_bytes())?;
        for (key, value) in self.pairs() {
            write_string(sink, key)?;
            write_string(sink, &value)?;
        }
        Ok(())
    }
}

fn write_string(sink: &mut dyn Write, s: &str) -> io::Result<()> {
    sink.write_all(&(s.len() as u32).to_be_bytes())?;
    sink.write_all(s.as_bytes())
}

/// A decoded data frame: sequence number and its pairs in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Batch-local sequence number.
    pub sequence: u32,
    /// Key/value pairs.
    pub pairs: Vec<(String, String)>,
}

impl DataFrame {
    /// Looks up the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parses the decompressed body of a payload frame into data frames.
pub fn decode_data_frames(mut buf: &[u8]) -> Result<Vec<DataFrame>> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let header = take(&mut buf, 2)?;
        if header != [PROTOCOL_VERSION, FRAME_DATA] {
            return Err(malformed(format!("unexpected frame header {:02X?}", header)));
        }
        let sequence = take_u32(&mut buf)?;
        let count = take_u32(&mut buf)?;
        let mut pairs = Vec::new();
        for _ in 0..count {
            let key = take_string(&mut buf)?;
            let value = take_string(&mut buf)?;
            pairs.push((key, value));
        }
        frames.push(DataFrame { sequence, pairs });
    }
    Ok(frames)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(malformed(format!("need {} bytes, have {}", n, buf.len())));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_string(buf: &mut &[u8]) -> Result<String> {
    let len = take_u32(buf)? as usize;
    let bytes = take(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("invalid UTF-8: {e}")))
}

fn malformed(reason: String) -> TransportError {
    TransportError::Encode {
        reason: format!("malformed data frame: {reason}"),
    }
}
