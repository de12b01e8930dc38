//! Batch framing and compression.
//!
//! A batch goes on the wire as two frames followed by a six byte acknowledgement
//! read back from the collector:
//!
//! ```text
//! ┌─────────┬──────┬─────────────────────┐
//! │ version │ type │ body                │
//! │ '1'     │ 'W'  │ u32 BE event count  │
//! │ '1'     │ 'C'  │ u32 BE length, data │
//! │ '1'     │ 'A'  │ u32 BE sequence     │  (collector -> courier)
//! └─────────┴──────┴─────────────────────┘
//! ```
//!
//! The compressed body is a zlib stream of every event's own sub-frame. Events are
//! numbered 1..=K within the batch; numbering never carries over between batches.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, TransportError};

/// Protocol version byte leading every frame.
pub const PROTOCOL_VERSION: u8 = b'1';
/// Frame type announcing the number of events in the next payload.
pub const FRAME_WINDOW_SIZE: u8 = b'W';
/// Frame type carrying the zlib-compressed event sub-frames.
pub const FRAME_COMPRESSED: u8 = b'C';
/// Frame type of the collector's acknowledgement.
pub const FRAME_ACK: u8 = b'A';
/// Size of a frame header: version, type and a big-endian u32.
pub const FRAME_HEADER_SIZE: usize = 6;
/// Size of an acknowledgement frame.
pub const ACK_FRAME_SIZE: usize = 6;

/// A record the transport can ship without knowing its layout.
///
/// Implementations write their own sub-frame, tagged with the sequence number the
/// encoder assigns. Writes go to an in-memory compressor and are not expected to
/// fail; an error aborts the worker that encoded the batch.
pub trait Event: Send + Sync + 'static {
    /// Writes this event, numbered `sequence`, into `sink`.
    fn serialize(&self, sequence: u32, sink: &mut dyn Write) -> io::Result<()>;
}

/// Decoded view of a six byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version byte.
    pub version: u8,
    /// Frame type byte.
    pub frame_type: u8,
    /// Event count, payload length or acknowledged sequence depending on the type.
    pub value: u32,
}

impl FrameHeader {
    /// Creates a header of the current protocol version.
    pub fn new(frame_type: u8, value: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            value,
        }
    }

    /// Encodes the header into its wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.frame_type;
        buf[2..].copy_from_slice(&self.value.to_be_bytes());
        buf
    }

    /// Decodes a header from its wire form. Any byte pattern is structurally valid.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            version: buf[0],
            frame_type: buf[1],
            value: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }
}

/// The collector's acknowledgement of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    /// Raw header as received.
    pub header: FrameHeader,
}

impl AckFrame {
    /// Decodes the six acknowledgement bytes.
    pub fn decode(buf: &[u8; ACK_FRAME_SIZE]) -> Self {
        Self {
            header: FrameHeader::decode(buf),
        }
    }

    /// Highest sequence number the collector reports as durably received.
    pub fn sequence(&self) -> u32 {
        self.header.value
    }

    /// Checks that this acknowledges a whole window of `window` events.
    pub fn verify(&self, window: u32) -> Result<()> {
        if self.header.version != PROTOCOL_VERSION {
            return Err(TransportError::InvalidAck {
                reason: format!(
                    "unexpected protocol version 0x{:02X}",
                    self.header.version
                ),
            });
        }
        if self.header.frame_type != FRAME_ACK {
            return Err(TransportError::InvalidAck {
                reason: format!("unexpected frame type 0x{:02X}", self.header.frame_type),
            });
        }
        if self.header.value != window {
            return Err(TransportError::InvalidAck {
                reason: format!(
                    "acknowledged sequence {} does not match window {}",
                    self.header.value, window
                ),
            });
        }
        Ok(())
    }
}

/// Wire bytes of one batch, produced once and resent unchanged on every retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    window: u32,
    window_frame: [u8; FRAME_HEADER_SIZE],
    payload_header: [u8; FRAME_HEADER_SIZE],
    payload: Bytes,
}

impl EncodedBatch {
    /// Number of events in the batch, as announced by the window frame.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// The complete window-size frame.
    pub fn window_frame(&self) -> &[u8] {
        &self.window_frame
    }

    /// Header of the compressed payload frame.
    pub fn payload_header(&self) -> &[u8] {
        &self.payload_header
    }

    /// Compressed body of the payload frame.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total bytes written per send attempt.
    pub fn wire_len(&self) -> usize {
        2 * FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Both frames concatenated exactly as they appear on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.window_frame);
        out.extend_from_slice(&self.payload_header);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Encodes batches into window and compressed-payload frames.
///
/// Keeps its scratch buffer between batches so steady-state encoding does not
/// reallocate.
#[derive(Debug)]
pub struct BatchEncoder {
    level: Compression,
    buffer: Vec<u8>,
}

impl BatchEncoder {
    /// Creates an encoder compressing at the given zlib level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            buffer: Vec::new(),
        }
    }

    /// Serializes and compresses `events`, numbering them from 1.
    pub fn encode<E: Event>(&mut self, events: &[E]) -> Result<EncodedBatch> {
        let window = u32::try_from(events.len()).map_err(|_| TransportError::Encode {
            reason: format!("batch of {} events exceeds the window limit", events.len()),
        })?;

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        let mut compressor = ZlibEncoder::new(buffer, self.level);
        for (sequence, event) in (1u32..).zip(events) {
            event
                .serialize(sequence, &mut compressor)
                .map_err(|e| TransportError::Encode {
                    reason: format!("event {sequence} failed to serialize: {e}"),
                })?;
        }
        let buffer = compressor.finish().map_err(|e| TransportError::Encode {
            reason: format!("compression failed: {e}"),
        })?;

        let payload_len = u32::try_from(buffer.len()).map_err(|_| TransportError::Encode {
            reason: format!("compressed payload of {} bytes is too large", buffer.len()),
        })?;
        let payload = Bytes::copy_from_slice(&buffer);
        self.buffer = buffer;

        Ok(EncodedBatch {
            window,
            window_frame: FrameHeader::new(FRAME_WINDOW_SIZE, window).encode(),
            payload_header: FrameHeader::new(FRAME_COMPRESSED, payload_len).encode(),
            payload,
        })
    }
}

impl Default for BatchEncoder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_COMPRESSION_LEVEL)
    }
}

/// Decompresses the body of a compressed payload frame.
pub fn inflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|e| TransportError::Encode {
            reason: format!("invalid zlib payload: {e}"),
        })?;
    Ok(out)
}
