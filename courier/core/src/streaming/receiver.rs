//! Inbound session reassembly

use std::collections::BTreeMap;
use std::time::Duration;

use super::{abort_reason, StreamConfig, StreamMetadata};
use crate::compression;
use crate::messages::SessionId;

/// Reassembles one inbound session
///
/// Chunks may arrive out of order and more than once (retransmission); each
/// sequence number is stored once. Errors are abort reason codes.
#[derive(Debug)]
pub struct StreamReceiver {
    session_id: SessionId,
    metadata: StreamMetadata,
    chunk_size: usize,
    expected_chunks: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_bytes: u64,
    last_activity: Duration,
}

impl StreamReceiver {
    /// Validate a `StreamStart` and prepare reassembly
    pub fn new(
        session_id: SessionId,
        metadata: StreamMetadata,
        chunk_size: usize,
        config: &StreamConfig,
        now: Duration,
    ) -> Result<Self, &'static str> {
        if metadata.total_size > config.max_stream_size {
            return Err(abort_reason::TOO_LARGE);
        }
        if chunk_size == 0 || chunk_size > config.max_chunk_size {
            return Err(abort_reason::CORRUPT_CHUNK);
        }

        let expected_chunks = metadata.total_size.div_ceil(chunk_size as u64);
        Ok(Self {
            session_id,
            metadata,
            chunk_size,
            expected_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            last_activity: now,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Note traffic from the sender
    pub fn touch(&mut self, now: Duration) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Time since the sender was last heard from
    pub fn idle_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_activity)
    }

    /// Distinct chunks stored so far
    pub fn chunks_received(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Store a chunk; `Ok(false)` for a duplicate
    pub fn accept_chunk(
        &mut self,
        seq: u64,
        compressed: bool,
        data: Vec<u8>,
    ) -> Result<bool, &'static str> {
        if seq >= self.expected_chunks {
            return Err(abort_reason::SIZE_MISMATCH);
        }
        if self.chunks.contains_key(&seq) {
            return Ok(false);
        }

        let data = if compressed {
            compression::decompress(&data, self.chunk_size)
                .map_err(|_| abort_reason::CORRUPT_CHUNK)?
        } else {
            data
        };
        if data.len() > self.chunk_size {
            return Err(abort_reason::CORRUPT_CHUNK);
        }

        self.received_bytes += data.len() as u64;
        if self.received_bytes > self.metadata.total_size {
            return Err(abort_reason::SIZE_MISMATCH);
        }
        self.chunks.insert(seq, data);
        Ok(true)
    }

    /// Handle the end marker
    ///
    /// `Ok(None)` while chunks are still missing; the marker is then left
    /// unacknowledged so the sender retransmits the gap.
    pub fn finish(&mut self, total_chunks: u64) -> Result<Option<Vec<u8>>, &'static str> {
        if total_chunks != self.expected_chunks {
            return Err(abort_reason::SIZE_MISMATCH);
        }
        if self.chunks_received() < total_chunks {
            return Ok(None);
        }
        if self.received_bytes != self.metadata.total_size {
            return Err(abort_reason::SIZE_MISMATCH);
        }

        let mut data = Vec::with_capacity(self.received_bytes as usize);
        for chunk in std::mem::take(&mut self.chunks).into_values() {
            data.extend_from_slice(&chunk);
        }
        Ok(Some(data))
    }
}
