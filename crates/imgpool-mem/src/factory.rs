//! Buffer construction and lazy pool wiring.

use std::io::Read;
use std::sync::Arc;

use imgpool_core::config::PoolConfig;
use imgpool_core::memory::{MemoryTrimmableRegistry, NoOpMemoryTrimmableRegistry};
use once_cell::sync::OnceCell;

use crate::bitmap::{BitmapCounter, BitmapPool};
use crate::buffer::PooledBuffer;
use crate::byte_array::{FlexByteArrayPool, GenericByteArrayPool};
use crate::chunk_pool::NativeMemoryChunkPool;
use crate::error::Result;
use crate::shared::SharedByteArray;
use crate::stats::{NoOpPoolStatsTracker, PoolStatsTracker};
use crate::stream::PooledBufferOutputStream;
use crate::streams::PooledByteStreams;

/// Builds [`PooledBuffer`]s and output streams on a native chunk pool.
#[derive(Debug, Clone)]
pub struct PooledBufferFactory {
    pool: Arc<NativeMemoryChunkPool>,
    streams: PooledByteStreams,
}

impl PooledBufferFactory {
    pub fn new(pool: Arc<NativeMemoryChunkPool>, streams: PooledByteStreams) -> Self {
        Self { pool, streams }
    }

    pub fn pool(&self) -> &Arc<NativeMemoryChunkPool> {
        &self.pool
    }

    /// A buffer of exactly `size` bytes holding whatever the pooled chunk
    /// last held.
    pub fn new_byte_buffer(&self, size: usize) -> Result<PooledBuffer> {
        let chunk_ref = self.pool.get_reference(size)?;
        // The buffer takes its own reference; ours closes on drop.
        PooledBuffer::new(&chunk_ref, size)
    }

    pub fn from_bytes(&self, bytes: &[u8]) -> Result<PooledBuffer> {
        let mut out = self.new_output_stream_with_capacity(bytes.len().max(1))?;
        out.write_bytes(bytes)?;
        out.to_byte_buffer()
    }

    /// Drain `reader` into a new buffer.
    pub fn from_reader<R: Read + ?Sized>(&self, reader: &mut R) -> Result<PooledBuffer> {
        let out = self.new_output_stream()?;
        self.copy_into(reader, out)
    }

    /// Like [`from_reader`](Self::from_reader), starting from a chunk of at
    /// least `initial_capacity` bytes.
    pub fn from_reader_with_capacity<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        initial_capacity: usize,
    ) -> Result<PooledBuffer> {
        let out = self.new_output_stream_with_capacity(initial_capacity)?;
        self.copy_into(reader, out)
    }

    fn copy_into<R: Read + ?Sized>(&self, reader: &mut R, mut out: PooledBufferOutputStream) -> Result<PooledBuffer> {
        self.streams.copy(reader, &mut out)?;
        let buffer = out.to_byte_buffer();
        out.close();
        buffer
    }

    pub fn new_output_stream(&self) -> Result<PooledBufferOutputStream> {
        PooledBufferOutputStream::new(self.pool.clone())
    }

    pub fn new_output_stream_with_capacity(&self, initial_capacity: usize) -> Result<PooledBufferOutputStream> {
        PooledBufferOutputStream::with_capacity(self.pool.clone(), initial_capacity)
    }
}

/// Stats trackers handed to the pools a [`PoolFactory`] builds.
#[derive(Clone)]
pub struct PoolTrackers {
    pub bitmap: Arc<dyn PoolStatsTracker>,
    pub native_memory_chunk: Arc<dyn PoolStatsTracker>,
    pub small_byte_array: Arc<dyn PoolStatsTracker>,
}

impl Default for PoolTrackers {
    fn default() -> Self {
        let noop: Arc<dyn PoolStatsTracker> = Arc::new(NoOpPoolStatsTracker);
        Self {
            bitmap: noop.clone(),
            native_memory_chunk: noop.clone(),
            small_byte_array: noop,
        }
    }
}

/// Builds every pool from one [`PoolConfig`], each on first use, and hands
/// out the same instance afterwards.
pub struct PoolFactory {
    config: PoolConfig,
    registry: Arc<dyn MemoryTrimmableRegistry>,
    trackers: PoolTrackers,
    bitmap_pool: OnceCell<Arc<BitmapPool>>,
    bitmap_counter: OnceCell<BitmapCounter>,
    flex_byte_array_pool: OnceCell<FlexByteArrayPool>,
    native_memory_chunk_pool: OnceCell<Arc<NativeMemoryChunkPool>>,
    pooled_buffer_factory: OnceCell<PooledBufferFactory>,
    pooled_byte_streams: OnceCell<PooledByteStreams>,
    shared_byte_array: OnceCell<SharedByteArray>,
    small_byte_array_pool: OnceCell<Arc<GenericByteArrayPool>>,
}

impl PoolFactory {
    /// A factory whose pools ignore memory-pressure events and track nothing.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(NoOpMemoryTrimmableRegistry), PoolTrackers::default())
    }

    pub fn with_registry(
        config: PoolConfig,
        registry: Arc<dyn MemoryTrimmableRegistry>,
        trackers: PoolTrackers,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            trackers,
            bitmap_pool: OnceCell::new(),
            bitmap_counter: OnceCell::new(),
            flex_byte_array_pool: OnceCell::new(),
            native_memory_chunk_pool: OnceCell::new(),
            pooled_buffer_factory: OnceCell::new(),
            pooled_byte_streams: OnceCell::new(),
            shared_byte_array: OnceCell::new(),
            small_byte_array_pool: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn bitmap_pool(&self) -> Result<&Arc<BitmapPool>> {
        self.bitmap_pool.get_or_try_init(|| {
            BitmapPool::new(
                self.config.bitmap_pool.clone(),
                self.registry.as_ref(),
                self.trackers.bitmap.clone(),
            )
        })
    }

    /// Counter for decoded bitmaps that bypass [`bitmap_pool`](Self::bitmap_pool).
    pub fn bitmap_counter(&self) -> Result<&BitmapCounter> {
        self.bitmap_counter
            .get_or_try_init(|| BitmapCounter::for_params(&self.config.bitmap_pool))
    }

    pub fn flex_byte_array_pool(&self) -> Result<&FlexByteArrayPool> {
        self.flex_byte_array_pool.get_or_try_init(|| {
            FlexByteArrayPool::new(self.config.flex_byte_array_pool.clone(), self.registry.as_ref())
        })
    }

    pub fn native_memory_chunk_pool(&self) -> Result<&Arc<NativeMemoryChunkPool>> {
        self.native_memory_chunk_pool.get_or_try_init(|| {
            NativeMemoryChunkPool::new(
                self.config.native_memory_chunk_pool.clone(),
                self.registry.as_ref(),
                self.trackers.native_memory_chunk.clone(),
            )
        })
    }

    pub fn pooled_buffer_factory(&self) -> Result<&PooledBufferFactory> {
        self.pooled_buffer_factory.get_or_try_init(|| {
            let pool = self.native_memory_chunk_pool()?.clone();
            let streams = self.pooled_byte_streams()?.clone();
            Ok(PooledBufferFactory::new(pool, streams))
        })
    }

    pub fn pooled_byte_streams(&self) -> Result<&PooledByteStreams> {
        self.pooled_byte_streams
            .get_or_try_init(|| PooledByteStreams::new(self.small_byte_array_pool()?.clone()))
    }

    /// Single shared array sized by the flex pool's min/max bucket sizes.
    pub fn shared_byte_array(&self) -> Result<&SharedByteArray> {
        self.shared_byte_array.get_or_try_init(|| {
            SharedByteArray::new(&self.config.flex_byte_array_pool, self.registry.as_ref())
        })
    }

    pub fn small_byte_array_pool(&self) -> Result<&Arc<GenericByteArrayPool>> {
        self.small_byte_array_pool.get_or_try_init(|| {
            GenericByteArrayPool::new(
                self.config.small_byte_array_pool.clone(),
                self.registry.as_ref(),
                self.trackers.small_byte_array.clone(),
            )
        })
    }
}

impl std::fmt::Debug for PoolFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
