//! Chunking: split outgoing file data into CHUNK records, reassemble incoming ones.

use crate::integrity;
use crate::protocol::{Message, CHUNK_SIZE};

/// Number of CHUNK records needed to stream `total_len` bytes.
pub fn chunk_count(total_len: u64) -> u64 {
    total_len.div_ceil(CHUNK_SIZE as u64)
}

/// Build a CHUNK message for one slice of file data (at most [`CHUNK_SIZE`] bytes).
/// The checksum covers the unpadded bytes.
pub fn chunk_message(data: &[u8]) -> Message {
    Message::Chunk {
        checksum: integrity::checksum(data),
        payload: data.to_vec(),
    }
}

/// Split a whole buffer into CHUNK messages. An empty buffer yields no chunks.
pub fn split_into_chunks(data: &[u8]) -> Vec<Message> {
    data.chunks(CHUNK_SIZE).map(chunk_message).collect()
}

/// Reassembles a stream of received chunks into file bytes.
///
/// CHUNK records carry no length, so padding and real trailing zeros look the
/// same. Every chunk but the last is therefore written in full; the most
/// recent chunk is held back and only its trailing zeros are stripped once the
/// stream ends. A file that really ends in NUL bytes loses them.
#[derive(Debug, Default)]
pub struct Reassembler {
    held: Option<Vec<u8>>,
    chunks: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify a received chunk. On success returns the bytes that are now safe
    /// to write (the previously held chunk, if any).
    pub fn accept(&mut self, checksum: u16, payload: Vec<u8>) -> Result<Option<Vec<u8>>, ChunkError> {
        if !integrity::verify_chunk(&payload, checksum) {
            return Err(ChunkError::ChecksumMismatch {
                index: self.chunks,
                expected: checksum,
                actual: integrity::checksum(&payload),
            });
        }
        self.chunks += 1;
        Ok(self.held.replace(payload))
    }

    /// Chunks accepted so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// End of stream: the held chunk with its padding stripped.
    pub fn finish(self) -> Option<Vec<u8>> {
        self.held.map(|mut last| {
            let end = last.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            last.truncate(end);
            last
        })
    }
}

/// Result of processing a received chunk that failed verification.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("checksum mismatch in chunk {index}: sent {expected}, computed {actual}")]
    ChecksumMismatch { index: u64, expected: u16, actual: u16 },
}
