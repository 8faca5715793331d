//! Frame Protocol
//!
//! Wire format for channel traffic: length-prefixed JSON with a CRC32
//! checksum and a flags byte.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+-----------+------------------------------+
//! | Length (4)     | Checksum (4)   | Flags (1) | Payload (variable)           |
//! | big-endian u32 | CRC32          | bit0=zlib | JSON Envelope                |
//! +----------------+----------------+-----------+------------------------------+
//! ```
//!
//! Length covers the payload only. The checksum is computed over the payload
//! bytes as transmitted (after compression, if any).
//!
//! # Limits
//!
//! - Maximum frame size is enforced on both encode and decode, and again on
//!   the decompressed size
//! - Length is validated before waiting for (or allocating) the payload
//! - A frame with a bad checksum or undecodable JSON is skipped; the decoder
//!   stays aligned on the next frame boundary

use serde::{de::DeserializeOwned, Serialize};

use super::config::PerformanceConfig;
use super::TransportError;
use crate::compression;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum + 1 byte flags
const HEADER_SIZE: usize = 9;

/// Payload is zlib-compressed
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Compute CRC32 checksum for payload
#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message to an uncompressed frame
///
/// # Errors
///
/// Returns `TransportError::SerializationError` if JSON serialization fails,
/// or `TransportError::FrameTooLarge` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    FrameEncoder::new().encode(msg)
}

/// Frame encoder with optional payload compression
#[derive(Clone, Debug, Default)]
pub struct FrameEncoder {
    /// Compress payloads strictly larger than this many bytes
    compression_threshold: Option<usize>,
}

impl FrameEncoder {
    /// Create an encoder that never compresses
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder honoring the channel performance settings
    #[must_use]
    pub fn from_performance(config: &PerformanceConfig) -> Self {
        Self {
            compression_threshold: config
                .enable_compression
                .then_some(config.compression_threshold),
        }
    }

    /// Encode a message to bytes
    ///
    /// # Errors
    ///
    /// See [`encode`].
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, TransportError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;

        if json.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: json.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let (flags, payload) = match self.compression_threshold {
            Some(threshold) if json.len() > threshold => {
                let packed = compression::compress(&json)?;
                // Incompressible payloads go out as-is
                if packed.len() < json.len() {
                    (FLAG_COMPRESSED, packed)
                } else {
                    (0, json)
                }
            }
            _ => (0, json),
        };

        let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        })?;
        let checksum = compute_checksum(&payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.push(flags);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(ChecksumMismatch | SerializationError)` for a corrupt frame,
    ///   which has been skipped; decoding may continue
    /// - `Err(FrameTooLarge)` if the length prefix is out of range; the
    ///   stream cannot be resynchronized
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        // The frame is consumed whether or not it decodes
        self.read_pos = payload_end;
        let payload = &self.buffer[payload_start..payload_end];

        let actual_checksum = compute_checksum(payload);
        if actual_checksum != expected_checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let msg = if flags & FLAG_COMPRESSED != 0 {
            let json = compression::decompress(payload, MAX_FRAME_SIZE)
                .map_err(|e| TransportError::SerializationError(e.to_string()))?;
            serde_json::from_slice(&json)
        } else {
            serde_json::from_slice(payload)
        }
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;

        Ok(Some(msg))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
