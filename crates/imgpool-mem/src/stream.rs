//! Growable output stream backed by pooled native chunks.

use std::io;
use std::sync::Arc;

use imgpool_core::reference::CloseableReference;

use crate::buffer::PooledBuffer;
use crate::chunk::NativeMemoryChunk;
use crate::chunk_pool::NativeMemoryChunkPool;
use crate::error::{Error, Result};
use crate::trace::debug_event;

/// Writes into a pooled chunk, trading it for a larger one from the same pool
/// whenever a write does not fit. Snapshots taken with
/// [`to_byte_buffer`](Self::to_byte_buffer) share the current chunk.
pub struct PooledBufferOutputStream {
    pool: Arc<NativeMemoryChunkPool>,
    chunk_ref: Option<CloseableReference<NativeMemoryChunk>>,
    count: usize,
}

impl PooledBufferOutputStream {
    /// A stream starting with the pool's smallest chunk.
    pub fn new(pool: Arc<NativeMemoryChunkPool>) -> Result<Self> {
        let initial = pool.min_buffer_size();
        Self::with_capacity(pool, initial)
    }

    pub fn with_capacity(pool: Arc<NativeMemoryChunkPool>, initial_capacity: usize) -> Result<Self> {
        if initial_capacity == 0 {
            return Err(Error::invalid_argument("initial capacity must be positive"));
        }
        let chunk_ref = pool.get_reference(initial_capacity)?;
        Ok(Self {
            pool,
            chunk_ref: Some(chunk_ref),
            count: 0,
        })
    }

    /// Bytes written so far.
    pub fn size(&self) -> usize {
        self.count
    }

    pub fn is_closed(&self) -> bool {
        self.chunk_ref.as_ref().map_or(true, |r| !r.is_valid())
    }

    fn chunk(&self) -> Result<NativeMemoryChunk> {
        let chunk_ref = self.chunk_ref.as_ref().ok_or(Error::InvalidStream)?;
        chunk_ref.get().map_err(|_| Error::InvalidStream)
    }

    /// Capacity of the current chunk.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.chunk()?.size())
    }

    /// Append `src`, growing into a bigger chunk first if needed.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let new_len = self
            .count
            .checked_add(src.len())
            .ok_or_else(|| Error::invalid_argument("write overflows the stream length"))?;
        self.realloc(new_len)?;
        if src.is_empty() {
            return Ok(());
        }
        self.chunk()?.write(self.count, src)?;
        self.count = new_len;
        Ok(())
    }

    fn realloc(&mut self, new_len: usize) -> Result<()> {
        let current = self.chunk()?;
        if new_len <= current.size() {
            return Ok(());
        }
        let bigger = self.pool.get_reference(new_len)?;
        let target = bigger.get().map_err(Error::from_core)?;
        current.copy(0, &target, 0, self.count)?;
        debug_event!(from = current.size(), to = target.size(), "output stream grew");
        // Swapping drops the old handle, returning its chunk to the pool.
        self.chunk_ref = Some(bigger);
        Ok(())
    }

    /// An immutable buffer over the bytes written so far. The stream stays
    /// usable; later writes that grow it move to a new chunk.
    pub fn to_byte_buffer(&self) -> Result<PooledBuffer> {
        let chunk_ref = self.chunk_ref.as_ref().ok_or(Error::InvalidStream)?;
        if !chunk_ref.is_valid() {
            return Err(Error::InvalidStream);
        }
        PooledBuffer::new(chunk_ref, self.count)
    }

    /// Give up the stream's chunk reference. Idempotent.
    pub fn close(&mut self) {
        self.chunk_ref = None;
    }
}

impl io::Write for PooledBufferOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for PooledBufferOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBufferOutputStream")
            .field("count", &self.count)
            .field("closed", &self.is_closed())
            .finish()
    }
}
