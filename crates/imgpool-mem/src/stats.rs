//! Pool statistics hooks.
//!
//! A pool reports every allocation, free, reuse and release to its tracker.
//! The hooks are called while the pool holds its lock, so a tracker must not
//! call back into the pool from inside one of them.

use std::collections::HashMap;
use std::sync::Weak;

/// Keys of the map returned by [`PoolStatsSource::stats`].
pub mod keys {
    pub const SOFT_CAP: &str = "soft_cap";
    pub const HARD_CAP: &str = "hard_cap";
    pub const USED_COUNT: &str = "used_count";
    pub const USED_BYTES: &str = "used_bytes";
    pub const FREE_COUNT: &str = "free_count";
    pub const FREE_BYTES: &str = "free_bytes";
    pub const BUCKETS_USED_PREFIX: &str = "buckets_used_";

    /// Key of the in-use count of the bucket for `bucketed_size`.
    pub fn buckets_used(bucketed_size: usize) -> String {
        format!("{BUCKETS_USED_PREFIX}{bucketed_size}")
    }
}

/// A pool able to report a snapshot of its counters.
pub trait PoolStatsSource: Send + Sync {
    fn stats(&self) -> HashMap<String, usize>;
}

/// Observer of pool events. Every hook defaults to doing nothing.
pub trait PoolStatsTracker: Send + Sync {
    /// Called once when the pool is registered with its owner.
    fn set_base_pool(&self, _pool: Weak<dyn PoolStatsSource>) {}

    /// A new value of `size` bytes was allocated.
    fn on_alloc(&self, _size: usize) {}

    /// A value of `size` bytes was freed for good.
    fn on_free(&self, _size: usize) {}

    /// A free value of `size` bytes was handed out again.
    fn on_value_reuse(&self, _size: usize) {}

    /// A value of `size` bytes went back to its bucket.
    fn on_value_release(&self, _size: usize) {}

    fn on_soft_cap_reached(&self) {}

    fn on_hard_cap_reached(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPoolStatsTracker;

impl PoolStatsTracker for NoOpPoolStatsTracker {}
