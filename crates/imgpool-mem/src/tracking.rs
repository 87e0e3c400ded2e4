//! Lightweight usage tracker.
//!
//! Counts pool events and keeps the peak of allocated-but-not-freed bytes.
//! Downstream can forward the numbers to whatever metrics system it uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, Weak};

use serde::Serialize;

use crate::stats::{PoolStatsSource, PoolStatsTracker};

/// Event counts seen by a [`PeakUsageTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounts {
    pub allocs: usize,
    pub frees: usize,
    pub reuses: usize,
    pub releases: usize,
    pub soft_cap_hits: usize,
    pub hard_cap_hits: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Default)]
pub struct PeakUsageTracker {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    reuses: AtomicUsize,
    releases: AtomicUsize,
    soft_cap_hits: AtomicUsize,
    hard_cap_hits: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    pool: Mutex<Option<Weak<dyn PoolStatsSource>>>,
}

impl PeakUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live-bytes value; updates the peak if higher.
    fn record_live(&self, live_bytes: usize) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while live_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                live_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(
            live_bytes,
            peak = self.peak_bytes.load(Ordering::Relaxed),
            "pool usage"
        );
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn alloc_count(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> UsageCounts {
        UsageCounts {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            soft_cap_hits: self.soft_cap_hits.load(Ordering::Relaxed),
            hard_cap_hits: self.hard_cap_hits.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak(),
        }
    }

    /// Stats of the pool this tracker is attached to, if it is still alive.
    ///
    /// Takes the pool's lock; never call it from inside a tracker hook.
    pub fn pool_stats(&self) -> Option<HashMap<String, usize>> {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)?;
        Some(pool.stats())
    }
}

impl PoolStatsTracker for PeakUsageTracker {
    fn set_base_pool(&self, pool: Weak<dyn PoolStatsSource>) {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
    }

    fn on_alloc(&self, size: usize) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.record_live(live);
    }

    fn on_free(&self, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        // Values allocated before this tracker was attached may be freed too.
        let _ = self
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(size))
            });
    }

    fn on_value_reuse(&self, _size: usize) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_value_release(&self, _size: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn on_soft_cap_reached(&self) {
        self.soft_cap_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_hard_cap_reached(&self) {
        self.hard_cap_hits.fetch_add(1, Ordering::Relaxed);
    }
}
