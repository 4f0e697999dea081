//! Splitting a file into parts and tracking the parts of one file while
//! they are uploaded by the chunk pool.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::store::StoreError;

/// One contiguous byte range of a file, uploaded as part `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// 1-based part index.
    pub index: u32,
    /// Byte offset from the start of the file.
    pub offset: u64,
    /// Number of bytes in this part.
    pub length: u64,
}

/// Split `[0, file_size)` into parts of `part_size` bytes; the last part
/// holds the remainder.
///
/// # Edge cases
/// - `file_size == 0` or `part_size == 0`: returns an empty Vec
pub fn plan_chunks(file_size: u64, part_size: u64) -> Vec<ChunkRange> {
    if file_size == 0 || part_size == 0 {
        return Vec::new();
    }

    let count = file_size.div_ceil(part_size);
    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut index = 1u32;

    while offset < file_size {
        let length = part_size.min(file_size - offset);
        chunks.push(ChunkRange {
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }

    chunks
}

/// A part in flight: read from local storage, waiting for a chunk worker.
pub struct Chunk {
    pub object_id: String,
    pub index: u32,
    pub data: Vec<u8>,
    pub group: Arc<ChunkGroup>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("object_id", &self.object_id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The first part of a file that failed to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: u32,
    pub error: StoreError,
}

#[derive(Default)]
struct GroupState {
    pending: usize,
    first_failure: Option<ChunkFailure>,
}

/// Completion counter shared by all parts of one file.
///
/// The file worker registers each part before queueing it and then waits;
/// chunk workers report each part exactly once. A failure does not cancel
/// the other parts.
#[derive(Default)]
pub struct ChunkGroup {
    state: Mutex<GroupState>,
    done: Condvar,
}

impl ChunkGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self) {
        self.state.lock().pending += 1;
    }

    pub fn complete(&self, index: u32, result: Result<(), StoreError>) {
        let mut state = self.state.lock();
        if let Err(error) = result {
            if state.first_failure.is_none() {
                state.first_failure = Some(ChunkFailure { index, error });
            }
        }
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every registered part has completed, then return the
    /// first failure, if any.
    pub fn wait(&self) -> Option<ChunkFailure> {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.done.wait(&mut state);
        }
        state.first_failure.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}
