//! Pool of [`NativeMemoryChunk`]s.

use std::sync::Arc;

use imgpool_core::config::PoolParams;
use imgpool_core::memory::MemoryTrimmableRegistry;

use crate::chunk::NativeMemoryChunk;
use crate::error::Result;
use crate::pool::{bucketed_size_in, BasePool, PoolAllocator};
use crate::stats::PoolStatsTracker;

/// Native chunks rounded up to the configured bucket sizes.
pub struct NativeChunkAllocator {
    bucket_sizes: Vec<usize>,
}

impl NativeChunkAllocator {
    pub fn new(params: &PoolParams) -> Self {
        Self {
            bucket_sizes: params.bucket_size_keys(),
        }
    }
}

impl PoolAllocator for NativeChunkAllocator {
    type Value = NativeMemoryChunk;

    fn alloc(&self, bucketed_size: usize) -> Result<NativeMemoryChunk> {
        NativeMemoryChunk::allocate(bucketed_size)
    }

    fn free(&self, value: NativeMemoryChunk) {
        value.close();
    }

    fn bucketed_size(&self, requested: usize) -> Result<usize> {
        bucketed_size_in(&self.bucket_sizes, requested)
    }

    fn bucketed_size_for_value(&self, value: &NativeMemoryChunk) -> usize {
        value.size()
    }

    fn is_reusable(&self, value: &NativeMemoryChunk) -> bool {
        !value.is_closed()
    }
}

pub type NativeMemoryChunkPool = BasePool<NativeChunkAllocator>;

impl BasePool<NativeChunkAllocator> {
    pub fn new(
        params: PoolParams,
        registry: &dyn MemoryTrimmableRegistry,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Arc<Self>> {
        let allocator = NativeChunkAllocator::new(&params);
        Self::create(allocator, params, registry, tracker)
    }

    /// Smallest configured bucket size. Pools without a bucket table fall
    /// back to their min bucket size.
    pub fn min_buffer_size(&self) -> usize {
        self.allocator()
            .bucket_sizes
            .first()
            .copied()
            .unwrap_or_else(|| self.params().min_bucket_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgpool_core::memory::NoOpMemoryTrimmableRegistry;
    use imgpool_core::units::KB;

    use crate::stats::NoOpPoolStatsTracker;

    fn pool() -> Arc<NativeMemoryChunkPool> {
        let buckets = [(32, 2), (64, 1), (128, 1)].into_iter().collect();
        let params = PoolParams::with_caps(128, 4 * KB, Some(buckets)).expect("params");
        NativeMemoryChunkPool::new(params, &NoOpMemoryTrimmableRegistry, Arc::new(NoOpPoolStatsTracker))
            .expect("pool")
    }

    #[test]
    fn rounds_up_to_bucket_sizes() {
        let p = pool();
        assert_eq!(p.min_buffer_size(), 32);
        assert_eq!(p.bucketed_size(1).expect("size"), 32);
        assert_eq!(p.bucketed_size(33).expect("size"), 64);
        assert_eq!(p.bucketed_size(129).expect("size"), 129);
        assert!(p.bucketed_size(0).is_err());
    }

    #[test]
    fn free_closes_and_closed_chunks_are_not_reused() {
        let p = pool();
        let chunk = p.get(20).expect("get");
        assert_eq!(chunk.size(), 32);
        let watcher = chunk.clone();
        chunk.close();
        p.release(chunk);
        assert!(watcher.is_closed());
        assert_eq!(p.free_counter().num_bytes, 0);

        let kept = p.get(20).expect("get");
        let kept_id = kept.id();
        p.release(kept);
        assert_eq!(p.get(30).expect("get").id(), kept_id);
    }
}
