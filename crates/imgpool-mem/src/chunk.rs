//! Fixed-size memory block with explicit, idempotent close.
//!
//! `NativeMemoryChunk` is a cheap handle; clones share the same block. All
//! access goes through a chunk-local lock. A copy between two chunks locks
//! both, lower id first, so concurrent copies in opposite directions cannot
//! deadlock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use imgpool_core::id::ChunkId;

use crate::error::{Error, Result};
use crate::pool::PoolValue;
use crate::trace::warn_event;

struct ChunkState {
    closed: bool,
    data: Box<[u8]>,
}

struct ChunkInner {
    id: ChunkId,
    size: usize,
    state: Mutex<ChunkState>,
}

impl Drop for ChunkInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            warn_event!(chunk = %self.id, size = self.size, "chunk dropped while still open");
            state.closed = true;
        }
    }
}

#[derive(Clone)]
pub struct NativeMemoryChunk {
    inner: Arc<ChunkInner>,
}

impl NativeMemoryChunk {
    /// Allocate a zeroed chunk of `size` bytes.
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize { size });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::AllocFailed {
                tag: "native_chunk",
                bytes: size,
            })?;
        data.resize(size, 0u8);
        Ok(Self {
            inner: Arc::new(ChunkInner {
                id: ChunkId::next(),
                size,
                state: Mutex::new(ChunkState {
                    closed: false,
                    data: data.into_boxed_slice(),
                }),
            }),
        })
    }

    pub fn id(&self) -> ChunkId {
        self.inner.id
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    fn lock(&self) -> MutexGuard<'_, ChunkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release the block. Later calls do nothing.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.data = Box::default();
        }
    }

    /// Copy as much of `src` as fits at `offset`. Returns the number of bytes
    /// written, which is less than `src.len()` near the end of the chunk.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let count = self.adjust_byte_count(offset, src.len());
        self.check_bounds(offset, src.len(), 0, count)?;
        state.data[offset..offset + count].copy_from_slice(&src[..count]);
        Ok(count)
    }

    /// Fill as much of `dst` as is available from `offset`. Returns the number
    /// of bytes read.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let count = self.adjust_byte_count(offset, dst.len());
        self.check_bounds(offset, dst.len(), 0, count)?;
        dst[..count].copy_from_slice(&state.data[offset..offset + count]);
        Ok(count)
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        let state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.data.get(offset).copied().ok_or_else(|| {
            Error::invalid_argument(format!(
                "offset {offset} out of bounds for chunk of {} bytes",
                self.size()
            ))
        })
    }

    /// Copy `count` bytes from this chunk at `offset` into `other` at
    /// `other_offset`. Both ranges must be in bounds; copying a chunk onto
    /// itself is rejected.
    pub fn copy(&self, offset: usize, other: &NativeMemoryChunk, other_offset: usize, count: usize) -> Result<()> {
        if self.id() == other.id() {
            warn_event!(chunk = %self.id(), "copy between chunks sharing the same block");
            return Err(Error::invalid_argument("cannot copy a chunk onto itself"));
        }

        // Lower id first.
        let (src, mut dst) = if self.id() < other.id() {
            let src = self.lock();
            let dst = other.lock();
            (src, dst)
        } else {
            let dst = other.lock();
            let src = self.lock();
            (src, dst)
        };

        if src.closed || dst.closed {
            return Err(Error::Closed);
        }
        self.check_bounds(offset, other.size(), other_offset, count)?;
        let bytes = &src.data[offset..offset + count];
        dst.data[other_offset..other_offset + count].copy_from_slice(bytes);
        Ok(())
    }

    fn adjust_byte_count(&self, offset: usize, count: usize) -> usize {
        self.size().saturating_sub(offset).min(count)
    }

    fn check_bounds(&self, my_offset: usize, other_len: usize, other_offset: usize, count: usize) -> Result<()> {
        let mine_ok = my_offset
            .checked_add(count)
            .is_some_and(|end| end <= self.size());
        let other_ok = other_offset
            .checked_add(count)
            .is_some_and(|end| end <= other_len);
        if mine_ok && other_ok {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "range out of bounds: offset {my_offset} (chunk {}) / {other_offset} (other {other_len}), count {count}",
                self.size()
            )))
        }
    }
}

impl PoolValue for NativeMemoryChunk {
    fn identity(&self) -> u64 {
        self.id().get()
    }
}

impl fmt::Debug for NativeMemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMemoryChunk")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
