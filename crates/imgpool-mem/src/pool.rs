//! Bucketed, capped allocator over an arbitrary value type.
//!
//! `BasePool` owns a set of size-class buckets, an identity set of the values
//! it has handed out, and two counters (used and free). The soft cap triggers
//! opportunistic trimming of free values; the hard cap rejects allocations.
//!
//! One mutex covers every piece of bookkeeping. Allocation and freeing of the
//! values themselves run outside it, so a slow allocation never blocks other
//! callers. Two racing allocations may therefore overshoot the hard cap
//! transiently; the next trim corrects it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use imgpool_core::config::{BucketLayout, PoolParams};
use imgpool_core::memory::{MemoryTrimType, MemoryTrimmable, MemoryTrimmableRegistry};
use imgpool_core::reference::{CloseableReference, ResourceReleaser};

use crate::bucket::{Bucket, BucketKind};
use crate::counter::Counter;
use crate::error::{Error, Result};
use crate::stats::{keys, PoolStatsSource, PoolStatsTracker};
use crate::trace::{debug_event, warn_event};

/// A value that can live in a pool. The pool tracks values by this identity,
/// which must stay stable for as long as the value exists.
pub trait PoolValue: Send + 'static {
    fn identity(&self) -> u64;
}

impl PoolValue for Vec<u8> {
    /// Address of the heap block. Stable across moves of the `Vec`; pooled
    /// arrays are never empty, so the address is unique among live arrays.
    fn identity(&self) -> u64 {
        self.as_ptr() as usize as u64
    }
}

/// Per-value-type policy plugged into a [`BasePool`].
pub trait PoolAllocator: Send + Sync + 'static {
    type Value: PoolValue;

    /// Allocate a value able to hold `bucketed_size`.
    fn alloc(&self, bucketed_size: usize) -> Result<Self::Value>;

    /// Give a value back to the system.
    fn free(&self, value: Self::Value);

    /// Size class for a request. Monotonic, never below `requested`, and an
    /// `InvalidSize` error for zero.
    fn bucketed_size(&self, requested: usize) -> Result<usize>;

    /// Size class of an existing value.
    fn bucketed_size_for_value(&self, value: &Self::Value) -> usize;

    /// Bytes a value of the given size class occupies.
    fn size_in_bytes(&self, bucketed_size: usize) -> usize {
        bucketed_size
    }

    fn is_reusable(&self, _value: &Self::Value) -> bool {
        true
    }

    /// Free-list flavour of every bucket of the pool.
    fn bucket_kind(&self) -> BucketKind {
        BucketKind::Strong
    }

    /// Max length of buckets created on demand.
    fn dynamic_bucket_length(&self, _params: &PoolParams) -> usize {
        usize::MAX
    }
}

/// Smallest entry of the ascending `sizes` that fits `requested`, else
/// `requested` itself.
pub(crate) fn bucketed_size_in(sizes: &[usize], requested: usize) -> Result<usize> {
    if requested == 0 {
        return Err(Error::InvalidSize { size: requested });
    }
    Ok(sizes
        .iter()
        .copied()
        .find(|&size| size >= requested)
        .unwrap_or(requested))
}

struct PoolState<V> {
    buckets: BTreeMap<usize, Bucket<V>>,
    in_use: HashSet<u64>,
    used: Counter,
    free: Counter,
}

pub struct BasePool<A: PoolAllocator> {
    allocator: A,
    params: PoolParams,
    layout: BucketLayout,
    tracker: Arc<dyn PoolStatsTracker>,
    state: Mutex<PoolState<A::Value>>,
}

impl<A: PoolAllocator> BasePool<A> {
    /// A pool that is not registered anywhere yet.
    pub fn with_allocator(
        allocator: A,
        params: PoolParams,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Self> {
        params.validate()?;
        let layout = params.bucket_layout();
        let mut pool = Self {
            allocator,
            params,
            layout,
            tracker,
            state: Mutex::new(PoolState {
                buckets: BTreeMap::new(),
                in_use: HashSet::new(),
                used: Counter::new(),
                free: Counter::new(),
            }),
        };
        let buckets = pool.init_buckets(&BTreeMap::new());
        pool.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .buckets = buckets;
        Ok(pool)
    }

    /// Build a pool and register it with `registry` and its tracker.
    pub fn create(
        allocator: A,
        params: PoolParams,
        registry: &dyn MemoryTrimmableRegistry,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(Self::with_allocator(allocator, params, tracker)?);
        pool.register(registry);
        Ok(pool)
    }

    /// Register for memory-pressure trims and hand the tracker a handle to
    /// this pool's stats. Both only keep weak references.
    pub fn register(self: &Arc<Self>, registry: &dyn MemoryTrimmableRegistry) {
        let trimmable: Weak<dyn MemoryTrimmable> = Arc::downgrade(self) as Weak<dyn MemoryTrimmable>;
        registry.register_memory_trimmable(trimmable);
        let source: Weak<dyn PoolStatsSource> = Arc::downgrade(self) as Weak<dyn PoolStatsSource>;
        self.tracker.set_base_pool(source);
    }

    pub fn params(&self) -> &PoolParams {
        &self.params
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn bucketed_size(&self, requested: usize) -> Result<usize> {
        self.allocator.bucketed_size(requested)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<A::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a value of at least `size` bytes, reusing a free one when possible.
    pub fn get(&self, size: usize) -> Result<A::Value> {
        self.ensure_pool_size_invariant()?;
        let bucketed_size = self.allocator.bucketed_size(size)?;
        let size_in_bytes = self.allocator.size_in_bytes(bucketed_size);

        let (admitted, doomed, used_bytes, free_bytes) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let mut doomed = Vec::new();
            // Buckets are only created for admitted allocations.
            if let Some(bucket) = state.buckets.get_mut(&bucketed_size) {
                while let Some(value) = bucket.get() {
                    let reused_bytes = self
                        .allocator
                        .size_in_bytes(self.allocator.bucketed_size_for_value(&value));
                    if !self.allocator.is_reusable(&value) {
                        // Freed behind the pool's back, e.g. a duplicate release.
                        bucket.decrement_in_use_count();
                        state.free.decrement(reused_bytes);
                        self.tracker.on_free(reused_bytes);
                        warn_event!(bucketed_size, "dropping stale free entry");
                        doomed.push(value);
                        continue;
                    }
                    if !state.in_use.insert(value.identity()) {
                        warn_event!(bucketed_size, "reused value was already marked in use");
                    }
                    state.used.increment(reused_bytes);
                    state.free.decrement(reused_bytes);
                    self.tracker.on_value_reuse(reused_bytes);
                    debug_event!(bucketed_size, bytes = reused_bytes, "get (reuse)");
                    drop(guard);
                    self.free_all(doomed);
                    return Ok(value);
                }
            }

            let admitted = self.can_allocate(state, size_in_bytes, &mut doomed);
            if admitted {
                state.used.increment(size_in_bytes);
                if let Some(bucket) = self.bucket_for(&mut state.buckets, bucketed_size) {
                    bucket.increment_in_use_count();
                }
            }
            (admitted, doomed, state.used.num_bytes, state.free.num_bytes)
        };
        self.free_all(doomed);

        if !admitted {
            debug_event!(
                requested = size_in_bytes,
                used_bytes,
                free_bytes,
                "get rejected by hard cap"
            );
            return Err(Error::PoolSizeViolation {
                hard_cap: self.params.max_size_hard_cap,
                used: used_bytes,
                free: free_bytes,
                requested: size_in_bytes,
            });
        }

        let value = match self.allocator.alloc(bucketed_size) {
            Ok(value) => value,
            Err(e) => {
                let reclaimed = {
                    let mut guard = self.lock();
                    let state = &mut *guard;
                    state.used.decrement(size_in_bytes);
                    if let Some(bucket) = state.buckets.get_mut(&bucketed_size) {
                        bucket.decrement_in_use_count();
                    }
                    if matches!(e, Error::AllocFailed { .. }) {
                        self.reclaim_locked(state)
                    } else {
                        Vec::new()
                    }
                };
                debug_event!(bucketed_size, reclaimed = reclaimed.len(), "alloc failed");
                self.free_all(reclaimed);
                return Err(e);
            }
        };

        let doomed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.in_use.insert(value.identity()) {
                warn_event!(bucketed_size, "allocated value was already marked in use");
            }
            let doomed = self.trim_to_soft_cap_locked(state);
            self.tracker.on_alloc(size_in_bytes);
            debug_event!(bucketed_size, bytes = size_in_bytes, "get (alloc)");
            doomed
        };
        self.free_all(doomed);
        Ok(value)
    }

    /// Like [`get`](Self::get), but wrapped in a reference that releases the
    /// value back to this pool when its last handle closes.
    pub fn get_reference(self: &Arc<Self>, size: usize) -> Result<CloseableReference<A::Value>> {
        let value = self.get(size)?;
        let releaser: Arc<dyn ResourceReleaser<A::Value>> = self.clone();
        Ok(CloseableReference::of(value, releaser))
    }

    /// Return a value to the pool. It is kept for reuse or freed right away.
    /// Values the pool does not recognize are freed without touching the
    /// counters.
    pub fn release(&self, value: A::Value) {
        let bucketed_size = self.allocator.bucketed_size_for_value(&value);
        let size_in_bytes = self.allocator.size_in_bytes(bucketed_size);

        let doomed = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if !state.in_use.remove(&value.identity()) {
                warn_event!(bucketed_size, "release of unrecognized value; freeing it");
                self.tracker.on_free(size_in_bytes);
                Some(value)
            } else {
                let reusable = self.allocator.is_reusable(&value);
                let bucket = self.bucket_for(&mut state.buckets, bucketed_size);
                match bucket {
                    Some(bucket)
                        if !bucket.is_max_length_exceeded()
                            && !self.soft_cap_exceeded(&state.used, &state.free)
                            && reusable =>
                    {
                        bucket.release(value);
                        state.free.increment(size_in_bytes);
                        state.used.decrement(size_in_bytes);
                        self.tracker.on_value_release(size_in_bytes);
                        debug_event!(bucketed_size, "release (reuse)");
                        None
                    }
                    bucket => {
                        if let Some(bucket) = bucket {
                            bucket.decrement_in_use_count();
                        }
                        state.used.decrement(size_in_bytes);
                        self.tracker.on_free(size_in_bytes);
                        debug_event!(bucketed_size, "release (free)");
                        Some(value)
                    }
                }
            }
        };

        if let Some(value) = doomed {
            self.allocator.free(value);
        }
    }

    /// Free every free-listed value. In-use values are untouched.
    pub fn trim_to_nothing(&self) {
        let doomed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let in_use_counts: BTreeMap<usize, usize> = state
                .buckets
                .iter()
                .map(|(size, bucket)| (*size, bucket.in_use_count()))
                .collect();
            let old = std::mem::replace(&mut state.buckets, self.init_buckets(&in_use_counts));
            let mut doomed = Vec::new();
            for (_, mut bucket) in old {
                let item_size = bucket.item_size();
                for value in bucket.drain() {
                    self.tracker.on_free(item_size);
                    doomed.push(value);
                }
            }
            state.free.reset();
            debug_event!(freed = doomed.len(), "trim to nothing");
            doomed
        };
        self.free_all(doomed);
    }

    /// Free values until used plus free is at most `target`, or nothing is
    /// free anymore.
    pub fn trim_to_size(&self, target: usize) {
        let doomed = {
            let mut guard = self.lock();
            self.trim_to_size_locked(&mut guard, target)
        };
        self.free_all(doomed);
    }

    /// Trim down to the soft cap if the pool is above it.
    pub fn trim_to_soft_cap(&self) {
        let doomed = {
            let mut guard = self.lock();
            self.trim_to_soft_cap_locked(&mut guard)
        };
        self.free_all(doomed);
    }

    pub fn is_max_size_soft_cap_exceeded(&self) -> bool {
        let guard = self.lock();
        self.soft_cap_exceeded(&guard.used, &guard.free)
    }

    pub fn used_counter(&self) -> Counter {
        self.lock().used
    }

    pub fn free_counter(&self) -> Counter {
        self.lock().free
    }

    /// Number of values currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }

    fn ensure_pool_size_invariant(&self) -> Result<()> {
        let guard = self.lock();
        if self.soft_cap_exceeded(&guard.used, &guard.free) && guard.free.num_bytes != 0 {
            return Err(Error::Invariant(format!(
                "pool above soft cap {} with {} free bytes",
                self.params.max_size_soft_cap, guard.free.num_bytes
            )));
        }
        Ok(())
    }

    fn soft_cap_exceeded(&self, used: &Counter, free: &Counter) -> bool {
        let exceeded = used.num_bytes + free.num_bytes > self.params.max_size_soft_cap;
        if exceeded {
            self.tracker.on_soft_cap_reached();
        }
        exceeded
    }

    fn can_allocate(
        &self,
        state: &mut PoolState<A::Value>,
        size_in_bytes: usize,
        doomed: &mut Vec<A::Value>,
    ) -> bool {
        let hard_cap = self.params.max_size_hard_cap;
        if size_in_bytes > hard_cap.saturating_sub(state.used.num_bytes) {
            self.tracker.on_hard_cap_reached();
            return false;
        }

        let soft_cap = self.params.max_size_soft_cap;
        let total = state.used.num_bytes + state.free.num_bytes;
        if size_in_bytes > soft_cap.saturating_sub(total) {
            doomed.extend(self.trim_to_size_locked(state, soft_cap.saturating_sub(size_in_bytes)));
        }

        let total = state.used.num_bytes + state.free.num_bytes;
        if size_in_bytes > hard_cap.saturating_sub(total) {
            self.tracker.on_hard_cap_reached();
            return false;
        }
        true
    }

    fn trim_to_soft_cap_locked(&self, state: &mut PoolState<A::Value>) -> Vec<A::Value> {
        if self.soft_cap_exceeded(&state.used, &state.free) {
            self.trim_to_size_locked(state, self.params.max_size_soft_cap)
        } else {
            Vec::new()
        }
    }

    /// Pop free values, smallest buckets first, until enough bytes are
    /// accounted as freed. The values are returned for the caller to free
    /// after unlocking.
    fn trim_to_size_locked(&self, state: &mut PoolState<A::Value>, target: usize) -> Vec<A::Value> {
        let total = state.used.num_bytes + state.free.num_bytes;
        let mut bytes_to_free = total.saturating_sub(target).min(state.free.num_bytes);
        let mut doomed = Vec::new();
        if bytes_to_free == 0 {
            return doomed;
        }
        debug_event!(target, total, bytes_to_free, "trim to size");

        for bucket in state.buckets.values_mut() {
            if bytes_to_free == 0 {
                break;
            }
            let item_size = bucket.item_size();
            while bytes_to_free > 0 {
                let Some(value) = bucket.pop() else { break };
                bytes_to_free = bytes_to_free.saturating_sub(item_size);
                state.free.decrement(item_size);
                self.tracker.on_free(item_size);
                doomed.push(value);
            }
        }
        doomed
    }

    /// Drop the free entries of reclaimable buckets after an allocation
    /// failure.
    fn reclaim_locked(&self, state: &mut PoolState<A::Value>) -> Vec<A::Value> {
        let mut reclaimed = Vec::new();
        for bucket in state.buckets.values_mut() {
            let item_size = bucket.item_size();
            for value in bucket.reclaim() {
                state.free.decrement(item_size);
                self.tracker.on_free(item_size);
                reclaimed.push(value);
            }
        }
        reclaimed
    }

    fn free_all(&self, values: Vec<A::Value>) {
        for value in values {
            self.allocator.free(value);
        }
    }

    /// The bucket for `bucketed_size`, created on demand for dynamic layouts.
    fn bucket_for<'a>(
        &self,
        buckets: &'a mut BTreeMap<usize, Bucket<A::Value>>,
        bucketed_size: usize,
    ) -> Option<&'a mut Bucket<A::Value>> {
        match self.layout {
            BucketLayout::Fixed(_) => buckets.get_mut(&bucketed_size),
            BucketLayout::Dynamic => Some(
                buckets
                    .entry(bucketed_size)
                    .or_insert_with(|| self.dynamic_bucket(bucketed_size, 0)),
            ),
        }
    }

    fn dynamic_bucket(&self, bucketed_size: usize, in_use: usize) -> Bucket<A::Value> {
        debug_event!(bucketed_size, "creating bucket");
        Bucket::new(
            self.allocator.bucket_kind(),
            self.allocator.size_in_bytes(bucketed_size),
            self.allocator.dynamic_bucket_length(&self.params),
            in_use,
        )
    }

    /// Fresh buckets carrying over the given in-use counts. Fixed layouts get
    /// their whole table back; dynamic layouts only keep buckets that still
    /// have values checked out.
    fn init_buckets(&self, in_use_counts: &BTreeMap<usize, usize>) -> BTreeMap<usize, Bucket<A::Value>> {
        match &self.layout {
            BucketLayout::Fixed(table) => table
                .iter()
                .map(|(&size, &max_length)| {
                    let in_use = in_use_counts.get(&size).copied().unwrap_or(0);
                    let bucket = Bucket::new(
                        self.allocator.bucket_kind(),
                        self.allocator.size_in_bytes(size),
                        max_length,
                        in_use,
                    );
                    (size, bucket)
                })
                .collect(),
            BucketLayout::Dynamic => in_use_counts
                .iter()
                .filter(|(_, in_use)| **in_use > 0)
                .map(|(&size, &in_use)| (size, self.dynamic_bucket(size, in_use)))
                .collect(),
        }
    }
}

impl<A: PoolAllocator> PoolStatsSource for BasePool<A> {
    fn stats(&self) -> HashMap<String, usize> {
        let guard = self.lock();
        let mut stats = HashMap::new();
        for (&size, bucket) in &guard.buckets {
            stats.insert(
                keys::buckets_used(self.allocator.size_in_bytes(size)),
                bucket.in_use_count(),
            );
        }
        stats.insert(keys::SOFT_CAP.to_string(), self.params.max_size_soft_cap);
        stats.insert(keys::HARD_CAP.to_string(), self.params.max_size_hard_cap);
        stats.insert(keys::USED_COUNT.to_string(), guard.used.count);
        stats.insert(keys::USED_BYTES.to_string(), guard.used.num_bytes);
        stats.insert(keys::FREE_COUNT.to_string(), guard.free.count);
        stats.insert(keys::FREE_BYTES.to_string(), guard.free.num_bytes);
        stats
    }
}

impl<A: PoolAllocator> MemoryTrimmable for BasePool<A> {
    /// Every trim level empties the free lists.
    fn trim(&self, _trim_type: MemoryTrimType) {
        self.trim_to_nothing();
    }
}

impl<A: PoolAllocator> ResourceReleaser<A::Value> for BasePool<A> {
    fn release(&self, value: A::Value) {
        BasePool::release(self, value);
    }
}

impl<A: PoolAllocator> std::fmt::Debug for BasePool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock();
        f.debug_struct("BasePool")
            .field("params", &self.params)
            .field("used", &guard.used)
            .field("free", &guard.free)
            .field("buckets", &guard.buckets)
            .finish()
    }
}
