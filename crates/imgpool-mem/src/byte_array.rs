//! Byte-array pools.
//!
//! Pooled arrays are `Vec<u8>` whose length is their bucketed size. Holders
//! may overwrite the contents but must not resize an array: its length is how
//! the pool finds its bucket again, and its heap address is its identity.

use std::collections::HashMap;
use std::sync::Arc;

use imgpool_core::config::PoolParams;
use imgpool_core::memory::MemoryTrimmableRegistry;
use imgpool_core::reference::CloseableReference;

use crate::bucket::BucketKind;
use crate::error::{Error, Result};
use crate::pool::{bucketed_size_in, BasePool, PoolAllocator};
use crate::stats::{NoOpPoolStatsTracker, PoolStatsSource, PoolStatsTracker};

/// Allocate a zeroed array, reporting allocator failure instead of aborting.
pub(crate) fn alloc_bytes(size: usize, tag: &'static str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|_| Error::AllocFailed { tag, bytes: size })?;
    bytes.resize(size, 0u8);
    Ok(bytes)
}

fn min_buffer_size(bucket_sizes: &[usize], params: &PoolParams) -> usize {
    bucket_sizes
        .first()
        .copied()
        .unwrap_or_else(|| params.min_bucket_size.max(1))
}

/// Plain arrays rounded up to the configured bucket sizes.
pub struct ByteArrayAllocator {
    bucket_sizes: Vec<usize>,
}

impl ByteArrayAllocator {
    pub fn new(params: &PoolParams) -> Self {
        Self {
            bucket_sizes: params.bucket_size_keys(),
        }
    }
}

impl PoolAllocator for ByteArrayAllocator {
    type Value = Vec<u8>;

    fn alloc(&self, bucketed_size: usize) -> Result<Vec<u8>> {
        alloc_bytes(bucketed_size, "byte_array")
    }

    fn free(&self, value: Vec<u8>) {
        drop(value);
    }

    fn bucketed_size(&self, requested: usize) -> Result<usize> {
        bucketed_size_in(&self.bucket_sizes, requested)
    }

    fn bucketed_size_for_value(&self, value: &Vec<u8>) -> usize {
        value.len()
    }
}

pub type GenericByteArrayPool = BasePool<ByteArrayAllocator>;

impl BasePool<ByteArrayAllocator> {
    pub fn new(
        params: PoolParams,
        registry: &dyn MemoryTrimmableRegistry,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Arc<Self>> {
        let allocator = ByteArrayAllocator::new(&params);
        Self::create(allocator, params, registry, tracker)
    }

    pub fn min_buffer_size(&self) -> usize {
        min_buffer_size(&self.allocator().bucket_sizes, self.params())
    }
}

/// Same sizing as [`ByteArrayAllocator`], but every bucket is reclaimable:
/// an allocation failure drops all free arrays before the error surfaces.
/// Buckets created on demand are capped at the pool's thread count.
pub struct SoftRefByteArrayAllocator {
    inner: ByteArrayAllocator,
    max_num_threads: Option<usize>,
}

impl SoftRefByteArrayAllocator {
    pub fn new(params: &PoolParams) -> Self {
        Self {
            inner: ByteArrayAllocator::new(params),
            max_num_threads: params.max_num_threads,
        }
    }
}

impl PoolAllocator for SoftRefByteArrayAllocator {
    type Value = Vec<u8>;

    fn alloc(&self, bucketed_size: usize) -> Result<Vec<u8>> {
        alloc_bytes(bucketed_size, "soft_ref_byte_array")
    }

    fn free(&self, value: Vec<u8>) {
        self.inner.free(value);
    }

    fn bucketed_size(&self, requested: usize) -> Result<usize> {
        self.inner.bucketed_size(requested)
    }

    fn bucketed_size_for_value(&self, value: &Vec<u8>) -> usize {
        self.inner.bucketed_size_for_value(value)
    }

    fn bucket_kind(&self) -> BucketKind {
        BucketKind::Reclaimable
    }

    fn dynamic_bucket_length(&self, _params: &PoolParams) -> usize {
        self.max_num_threads.unwrap_or(usize::MAX)
    }
}

pub type SoftRefByteArrayPool = BasePool<SoftRefByteArrayAllocator>;

impl BasePool<SoftRefByteArrayAllocator> {
    pub fn new(
        params: PoolParams,
        registry: &dyn MemoryTrimmableRegistry,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Arc<Self>> {
        let allocator = SoftRefByteArrayAllocator::new(&params);
        Self::create(allocator, params, registry, tracker)
    }

    pub fn min_buffer_size(&self) -> usize {
        min_buffer_size(&self.allocator().inner.bucket_sizes, self.params())
    }
}

/// Byte arrays for transient decode work, shared by at most
/// `max_num_threads` threads at a time. Bucket lengths track the thread
/// count rather than a byte budget.
#[derive(Debug, Clone)]
pub struct FlexByteArrayPool {
    delegate: Arc<SoftRefByteArrayPool>,
}

impl FlexByteArrayPool {
    pub fn new(params: PoolParams, registry: &dyn MemoryTrimmableRegistry) -> Result<Self> {
        if !params.max_num_threads.is_some_and(|n| n > 0) {
            return Err(Error::invalid_argument(
                "flex byte array pool needs a positive max_num_threads",
            ));
        }
        let delegate = SoftRefByteArrayPool::new(params, registry, Arc::new(NoOpPoolStatsTracker))?;
        Ok(Self { delegate })
    }

    /// An array of at least `size` bytes that returns to the pool when its
    /// last reference closes.
    pub fn get(&self, size: usize) -> Result<CloseableReference<Vec<u8>>> {
        self.delegate.get_reference(size)
    }

    pub fn release(&self, value: Vec<u8>) {
        self.delegate.release(value);
    }

    pub fn stats(&self) -> HashMap<String, usize> {
        self.delegate.stats()
    }

    pub fn min_buffer_size(&self) -> usize {
        self.delegate.min_buffer_size()
    }

    pub fn delegate(&self) -> &Arc<SoftRefByteArrayPool> {
        &self.delegate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgpool_core::memory::NoOpMemoryTrimmableRegistry;

    use crate::pool::PoolValue;
    use crate::stats::keys;

    fn generic(table: &[(usize, usize)]) -> Arc<GenericByteArrayPool> {
        let params = PoolParams::with_caps(64, 256, Some(table.iter().copied().collect()))
            .expect("params");
        GenericByteArrayPool::new(params, &NoOpMemoryTrimmableRegistry, Arc::new(NoOpPoolStatsTracker))
            .expect("pool")
    }

    #[test]
    fn arrays_have_bucketed_length() {
        let pool = generic(&[(8, 2), (32, 2)]);
        assert_eq!(pool.min_buffer_size(), 8);
        assert_eq!(pool.get(5).expect("get").len(), 8);
        assert_eq!(pool.get(9).expect("get").len(), 32);
        assert_eq!(pool.get(40).expect("get").len(), 40);
    }

    #[test]
    fn unbucketed_sizes_are_not_kept() {
        let pool = generic(&[(8, 2)]);
        let big = pool.get(40).expect("get");
        pool.release(big);
        assert_eq!(pool.free_counter().num_bytes, 0);
        assert_eq!(pool.used_counter().num_bytes, 0);
    }

    #[test]
    fn flex_requires_threads() {
        let mut params = PoolParams::with_caps(64, 256, None).expect("params");
        assert!(FlexByteArrayPool::new(params.clone(), &NoOpMemoryTrimmableRegistry).is_err());
        params.max_num_threads = Some(0);
        assert!(FlexByteArrayPool::new(params, &NoOpMemoryTrimmableRegistry).is_err());
    }

    #[test]
    fn flex_reference_returns_array() {
        let mut params = PoolParams::with_caps(1024, 4096, Some([(128, 2), (256, 2)].into_iter().collect()))
            .expect("params");
        params.max_num_threads = Some(2);
        let flex = FlexByteArrayPool::new(params, &NoOpMemoryTrimmableRegistry).expect("flex");
        assert_eq!(flex.min_buffer_size(), 128);

        let mut first = flex.get(100).expect("get");
        let identity = first.with(|a| a.identity()).expect("open");
        assert_eq!(first.with(Vec::len).expect("open"), 128);
        first.close();
        assert_eq!(flex.stats()[keys::FREE_BYTES], 128);

        let second = flex.get(128).expect("get");
        assert_eq!(second.with(|a| a.identity()).expect("open"), identity);
    }
}
