//! Immutable, reference-counted views over pooled native chunks.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Mutex, MutexGuard, PoisonError};

use imgpool_core::id::ChunkId;
use imgpool_core::reference::CloseableReference;

use crate::chunk::NativeMemoryChunk;
use crate::error::{Error, Result};

/// The first `size` bytes of a pooled chunk. Holds its own reference on the
/// chunk; closing the buffer (or dropping it) gives that reference up.
pub struct PooledBuffer {
    size: usize,
    chunk_ref: Mutex<Option<CloseableReference<NativeMemoryChunk>>>,
}

impl PooledBuffer {
    /// A view of the first `size` bytes of `chunk_ref`'s chunk. The buffer
    /// takes a new reference; the caller keeps its own.
    pub fn new(chunk_ref: &CloseableReference<NativeMemoryChunk>, size: usize) -> Result<Self> {
        let chunk_size = chunk_ref.with(NativeMemoryChunk::size).map_err(Error::from_core)?;
        if size > chunk_size {
            return Err(Error::invalid_argument(format!(
                "buffer size {size} exceeds chunk size {chunk_size}"
            )));
        }
        let chunk_ref = chunk_ref.try_clone().map_err(Error::from_core)?;
        Ok(Self {
            size,
            chunk_ref: Mutex::new(Some(chunk_ref)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<CloseableReference<NativeMemoryChunk>>> {
        self.chunk_ref.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_chunk<R>(&self, f: impl FnOnce(&NativeMemoryChunk) -> Result<R>) -> Result<R> {
        let guard = self.lock();
        let chunk_ref = guard.as_ref().ok_or(Error::Closed)?;
        let chunk = chunk_ref.get().map_err(Error::from_core)?;
        f(&chunk)
    }

    pub fn size(&self) -> Result<usize> {
        self.with_chunk(|_| Ok(self.size))
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        self.with_chunk(|chunk| {
            if offset >= self.size {
                return Err(Error::invalid_argument(format!(
                    "offset {offset} out of bounds for buffer of {} bytes",
                    self.size
                )));
            }
            chunk.read_byte(offset)
        })
    }

    /// Fill `dst` from `offset`. The whole range must lie within the buffer.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        self.with_chunk(|chunk| {
            let in_bounds = offset
                .checked_add(dst.len())
                .is_some_and(|end| end <= self.size);
            if !in_bounds {
                return Err(Error::invalid_argument(format!(
                    "read of {} bytes at {offset} exceeds buffer of {} bytes",
                    dst.len(),
                    self.size
                )));
            }
            chunk.read(offset, dst)
        })
    }

    /// Copy of the whole buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Id of the backing chunk.
    pub fn chunk_id(&self) -> Result<ChunkId> {
        self.with_chunk(|chunk| Ok(chunk.id()))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().as_ref().map_or(true, |r| !r.is_valid())
    }

    pub fn close(&self) {
        // Take the reference out first so the pool release runs unlocked.
        let chunk_ref = self.lock().take();
        drop(chunk_ref);
    }

    /// A reader over this buffer.
    pub fn reader(&self) -> Result<PooledBufferInputStream<'_>> {
        PooledBufferInputStream::new(self)
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `Read` + `Seek` over a [`PooledBuffer`]. Seeks are clamped to the buffer.
#[derive(Debug)]
pub struct PooledBufferInputStream<'a> {
    buffer: &'a PooledBuffer,
    size: usize,
    offset: usize,
}

impl<'a> PooledBufferInputStream<'a> {
    pub fn new(buffer: &'a PooledBuffer) -> Result<Self> {
        let size = buffer.size()?;
        Ok(Self {
            buffer,
            size,
            offset: 0,
        })
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.offset)
    }
}

impl Read for PooledBufferInputStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining().min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.buffer.read(self.offset, &mut buf[..n])?;
        self.offset += n;
        Ok(n)
    }
}

impl Seek for PooledBufferInputStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(n) => self.offset as i128 + n as i128,
            SeekFrom::End(n) => size + n as i128,
        };
        self.offset = target.clamp(0, size) as usize;
        Ok(self.offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_ref(bytes: &[u8]) -> CloseableReference<NativeMemoryChunk> {
        let chunk = NativeMemoryChunk::allocate(bytes.len()).expect("alloc");
        chunk.write(0, bytes).expect("write");
        CloseableReference::of(chunk, std::sync::Arc::new(|c: NativeMemoryChunk| c.close()))
    }

    #[test]
    fn buffer_may_be_smaller_than_chunk() {
        let r = chunk_ref(&[1, 2, 3, 4, 5, 6]);
        let buf = PooledBuffer::new(&r, 4).expect("buffer");
        assert_eq!(r.shared_ref_count(), 2);
        assert_eq!(buf.size().expect("size"), 4);
        assert_eq!(buf.read_byte(3).expect("byte"), 4);
        assert!(buf.read_byte(4).is_err());
        let mut out = [0u8; 2];
        buf.read(2, &mut out).expect("read");
        assert_eq!(out, [3, 4]);
        assert!(buf.read(3, &mut out).is_err());
        assert!(PooledBuffer::new(&r, 7).is_err());
    }

    #[test]
    fn closed_buffer_rejects_access() {
        let r = chunk_ref(&[9; 8]);
        let buf = PooledBuffer::new(&r, 8).expect("buffer");
        buf.close();
        buf.close();
        assert!(buf.is_closed());
        assert_eq!(r.shared_ref_count(), 1);
        assert!(matches!(buf.size(), Err(Error::Closed)));
        assert!(matches!(buf.read_byte(0), Err(Error::Closed)));
        assert!(matches!(buf.chunk_id(), Err(Error::Closed)));
        assert!(buf.reader().is_err());
    }

    #[test]
    fn reader_reads_and_seeks() {
        let r = chunk_ref(&[10, 11, 12, 13, 14]);
        let buf = PooledBuffer::new(&r, 5).expect("buffer");
        let mut reader = buf.reader().expect("reader");
        let mut two = [0u8; 2];
        reader.read_exact(&mut two).expect("read");
        assert_eq!(two, [10, 11]);
        assert_eq!(reader.seek(SeekFrom::Current(-10)).expect("seek"), 0);
        assert_eq!(reader.seek(SeekFrom::End(-1)).expect("seek"), 4);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).expect("read");
        assert_eq!(rest, vec![14]);
        assert_eq!(reader.seek(SeekFrom::Start(99)).expect("seek"), 5);
        assert_eq!(reader.read(&mut two).expect("read"), 0);
    }
}
