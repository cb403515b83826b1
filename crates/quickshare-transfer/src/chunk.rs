use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use quickshare_types::Chunk;

use crate::error::TransferError;
use crate::protocol::BLOCK_SIZE;

/// Smallest chunk accepted for a file that spans more than one chunk.
pub const MIN_CHUNK_SIZE: u64 = BLOCK_SIZE as u64;

/// Upper bound on chunks per transfer.
pub const MAX_CHUNK_COUNT: u32 = 1 << 20;

/// Number of chunks for a file. An empty file is a single empty chunk.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidPartition("chunk size must be positive".into()));
    }
    if file_size == 0 {
        return Ok(1);
    }
    u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| {
        TransferError::InvalidPartition(format!(
            "{} bytes at {} bytes per chunk needs more than {} chunks",
            file_size,
            chunk_size,
            u32::MAX
        ))
    })
}

/// Chunk count for a transfer, bounded by [`MIN_CHUNK_SIZE`] and
/// [`MAX_CHUNK_COUNT`]. A file that fits in one chunk may use any chunk size.
pub fn checked_chunk_count(file_size: u64, chunk_size: u64) -> Result<u32, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    if count > 1 && chunk_size < MIN_CHUNK_SIZE {
        return Err(TransferError::InvalidPartition(format!(
            "chunk size {} is below the {} byte minimum",
            chunk_size, MIN_CHUNK_SIZE
        )));
    }
    if count > MAX_CHUNK_COUNT {
        return Err(TransferError::InvalidPartition(format!(
            "{} chunks exceeds the limit of {}",
            count, MAX_CHUNK_COUNT
        )));
    }
    Ok(count)
}

/// Split `[0, file_size)` into fixed-size chunks; the last takes the remainder.
pub fn partition(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    Ok((0..count)
        .map(|index| {
            let byte_offset = index as u64 * chunk_size;
            Chunk {
                index,
                byte_offset,
                byte_length: chunk_size.min(file_size - byte_offset),
            }
        })
        .collect())
}

const PENDING: u8 = 0;
const DONE: u8 = 1;

/// Per-chunk completion state shared by the connections of one session.
///
/// A chunk is marked done only after its hash check passed and its bytes
/// were flushed, so `is_complete` is the gate for full-file hashing.
pub struct ChunkLedger {
    states: Vec<AtomicU8>,
    failures: Vec<AtomicU32>,
    done: AtomicU32,
}

impl ChunkLedger {
    pub fn new(chunk_count: u32) -> Self {
        Self {
            states: (0..chunk_count).map(|_| AtomicU8::new(PENDING)).collect(),
            failures: (0..chunk_count).map(|_| AtomicU32::new(0)).collect(),
            done: AtomicU32::new(0),
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn is_done(&self, index: u32) -> bool {
        self.states
            .get(index as usize)
            .is_some_and(|s| s.load(Ordering::Acquire) == DONE)
    }

    /// Mark a chunk done. Returns true only for the first caller.
    pub fn mark_done(&self, index: u32) -> bool {
        let Some(state) = self.states.get(index as usize) else {
            return false;
        };
        let newly = state
            .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if newly {
            self.done.fetch_add(1, Ordering::AcqRel);
        }
        newly
    }

    /// Count a failed verification. Returns the failures so far for the chunk.
    pub fn record_failure(&self, index: u32) -> u32 {
        self.failures
            .get(index as usize)
            .map_or(0, |f| f.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn done_count(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.done_count() == self.chunk_count()
    }

    /// Indices still waiting for a verified copy.
    pub fn pending(&self) -> Vec<u32> {
        (0..self.chunk_count()).filter(|&i| !self.is_done(i)).collect()
    }
}
