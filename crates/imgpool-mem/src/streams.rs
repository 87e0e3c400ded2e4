//! Stream copies through a temporary array borrowed from a byte-array pool.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use imgpool_core::config::defaults::DEFAULT_IO_BUFFER_SIZE;

use crate::byte_array::GenericByteArrayPool;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PooledByteStreams {
    pool: Arc<GenericByteArrayPool>,
    temp_buf_size: usize,
}

impl PooledByteStreams {
    pub fn new(pool: Arc<GenericByteArrayPool>) -> Result<Self> {
        Self::with_temp_buf_size(pool, DEFAULT_IO_BUFFER_SIZE)
    }

    pub fn with_temp_buf_size(pool: Arc<GenericByteArrayPool>, temp_buf_size: usize) -> Result<Self> {
        if temp_buf_size == 0 {
            return Err(Error::invalid_argument("temp buffer size must be positive"));
        }
        Ok(Self { pool, temp_buf_size })
    }

    pub fn temp_buf_size(&self) -> usize {
        self.temp_buf_size
    }

    /// Copy until `from` is exhausted. Returns the number of bytes copied.
    pub fn copy<R, W>(&self, from: &mut R, to: &mut W) -> Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        self.with_temp(|tmp| {
            let mut copied = 0u64;
            loop {
                let n = read_retrying(from, tmp)?;
                if n == 0 {
                    return Ok(copied);
                }
                to.write_all(&tmp[..n])?;
                copied += n as u64;
            }
        })
    }

    /// Copy at most `n` bytes, stopping early at end of input.
    pub fn copy_n<R, W>(&self, from: &mut R, to: &mut W, n: u64) -> Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        if n == 0 {
            return Err(Error::invalid_argument("copy length must be positive"));
        }
        self.with_temp(|tmp| {
            let mut copied = 0u64;
            while copied < n {
                let want = (n - copied).min(tmp.len() as u64) as usize;
                let read = read_retrying(from, &mut tmp[..want])?;
                if read == 0 {
                    break;
                }
                to.write_all(&tmp[..read])?;
                copied += read as u64;
            }
            Ok(copied)
        })
    }

    // The temp array goes back to the pool whether or not `f` succeeds.
    fn with_temp<T>(&self, f: impl FnOnce(&mut [u8]) -> Result<T>) -> Result<T> {
        let mut tmp = self.pool.get(self.temp_buf_size)?;
        let result = f(&mut tmp[..self.temp_buf_size]);
        self.pool.release(tmp);
        result
    }
}

fn read_retrying<R: Read + ?Sized>(from: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match from.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
