//! A single reusable byte array handed to one holder at a time.
//!
//! `get` blocks until the previous holder's reference is closed. The array is
//! grown, never multiplied: a request larger than the cached array replaces
//! it. Trims skip the array while it is checked out instead of waiting.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use imgpool_core::config::PoolParams;
use imgpool_core::memory::{MemoryTrimType, MemoryTrimmable, MemoryTrimmableRegistry};
use imgpool_core::reference::{CloseableReference, ResourceReleaser};

use crate::byte_array::alloc_bytes;
use crate::error::{Error, Result};
use crate::trace::debug_event;

/// Semaphore with a single permit.
struct BinarySemaphore {
    available: Mutex<bool>,
    released: Condvar,
}

impl BinarySemaphore {
    fn new() -> Self {
        Self {
            available: Mutex::new(true),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) {
        let mut available = self.lock();
        while !*available {
            available = self
                .released
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available = false;
    }

    fn try_acquire(&self) -> bool {
        let mut available = self.lock();
        if *available {
            *available = false;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        *self.lock() = true;
        self.released.notify_one();
    }
}

struct Shared {
    min_size: usize,
    max_size: usize,
    slot: Mutex<Option<Vec<u8>>>,
    permit: BinarySemaphore,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResourceReleaser<Vec<u8>> for Shared {
    fn release(&self, value: Vec<u8>) {
        *self.slot() = Some(value);
        self.permit.release();
    }
}

impl MemoryTrimmable for Shared {
    fn trim(&self, _trim_type: MemoryTrimType) {
        if !self.permit.try_acquire() {
            debug_event!("shared byte array in use; skipping trim");
            return;
        }
        self.slot().take();
        self.permit.release();
    }
}

#[derive(Clone)]
pub struct SharedByteArray {
    inner: Arc<Shared>,
}

impl SharedByteArray {
    /// Sizes come from `params.min_bucket_size` (must be positive) and
    /// `params.max_bucket_size`.
    pub fn new(params: &PoolParams, registry: &dyn MemoryTrimmableRegistry) -> Result<Self> {
        if params.min_bucket_size == 0 {
            return Err(Error::invalid_argument("min bucket size must be positive"));
        }
        if params.max_bucket_size < params.min_bucket_size {
            return Err(Error::invalid_argument(
                "max bucket size is below min bucket size",
            ));
        }
        let inner = Arc::new(Shared {
            min_size: params.min_bucket_size,
            max_size: params.max_bucket_size,
            slot: Mutex::new(None),
            permit: BinarySemaphore::new(),
        });
        registry.register_memory_trimmable(Arc::downgrade(&inner) as Weak<dyn MemoryTrimmable>);
        Ok(Self { inner })
    }

    pub fn min_size(&self) -> usize {
        self.inner.min_size
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// `size` raised to the min size, then to the next power of two.
    pub fn bucketed_size(&self, size: usize) -> usize {
        size.max(self.inner.min_size).next_power_of_two()
    }

    /// Block until the array is free, then hand it out with at least `size`
    /// bytes.
    pub fn get(&self, size: usize) -> Result<CloseableReference<Vec<u8>>> {
        if size == 0 {
            return Err(Error::InvalidSize { size });
        }
        if size > self.inner.max_size {
            return Err(Error::invalid_argument(format!(
                "requested size {size} is above the max of {}",
                self.inner.max_size
            )));
        }

        self.inner.permit.acquire();
        let bucketed_size = self.bucketed_size(size);
        let cached = self.inner.slot().take();
        let array = match cached {
            Some(array) if array.len() >= bucketed_size => array,
            stale => {
                drop(stale);
                match alloc_bytes(bucketed_size, "shared_byte_array") {
                    Ok(array) => {
                        debug_event!(bucketed_size, "shared byte array grown");
                        array
                    }
                    Err(e) => {
                        self.inner.permit.release();
                        return Err(e);
                    }
                }
            }
        };

        let releaser: Arc<dyn ResourceReleaser<Vec<u8>>> = self.inner.clone();
        Ok(CloseableReference::of(array, releaser))
    }

    /// Length of the cached array, `None` when there is none or it is
    /// checked out.
    pub fn cached_len(&self) -> Option<usize> {
        self.inner.slot().as_ref().map(Vec::len)
    }

    pub fn trim(&self, trim_type: MemoryTrimType) {
        self.inner.trim(trim_type);
    }
}

impl std::fmt::Debug for SharedByteArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedByteArray")
            .field("min_size", &self.inner.min_size)
            .field("max_size", &self.inner.max_size)
            .field("cached_len", &self.cached_len())
            .finish()
    }
}
