//! Memory-pressure interfaces.
//!
//! Pools register themselves with a host-provided registry at construction.
//! The host later calls `trim` on every live registrant when memory runs low.
//! Registries only hold weak references, so a registration never keeps a pool
//! alive.

use std::sync::{Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};

/// Kind of memory-pressure event delivered to trimmables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryTrimType {
    /// The process is close to its heap limit.
    OnCloseToHeapLimit,
    /// The system is low on memory while the app is in the foreground.
    OnSystemLowMemoryForeground,
    /// The system is low on memory while the app is in the background.
    OnSystemLowMemoryBackground,
    /// The app moved to the background.
    OnAppBackgrounded,
}

impl MemoryTrimType {
    /// Fraction of trimmable memory a registrant is asked to give back.
    pub fn suggested_trim_ratio(self) -> f64 {
        match self {
            MemoryTrimType::OnCloseToHeapLimit => 0.5,
            MemoryTrimType::OnSystemLowMemoryForeground => 0.5,
            MemoryTrimType::OnSystemLowMemoryBackground => 1.0,
            MemoryTrimType::OnAppBackgrounded => 1.0,
        }
    }
}

/// Something that can give memory back on request.
pub trait MemoryTrimmable: Send + Sync {
    fn trim(&self, trim_type: MemoryTrimType);
}

/// Host-side registry of trimmables.
pub trait MemoryTrimmableRegistry: Send + Sync {
    fn register_memory_trimmable(&self, trimmable: Weak<dyn MemoryTrimmable>);
    fn unregister_memory_trimmable(&self, trimmable: &Weak<dyn MemoryTrimmable>);
}

/// Registry that ignores every registration. The default for hosts that never
/// deliver memory-pressure events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMemoryTrimmableRegistry;

impl MemoryTrimmableRegistry for NoOpMemoryTrimmableRegistry {
    fn register_memory_trimmable(&self, _trimmable: Weak<dyn MemoryTrimmable>) {}
    fn unregister_memory_trimmable(&self, _trimmable: &Weak<dyn MemoryTrimmable>) {}
}

/// Registry that remembers its registrants and forwards trims to those still
/// alive.
#[derive(Default)]
pub struct TrimmableRegistryImpl {
    entries: Mutex<Vec<Weak<dyn MemoryTrimmable>>>,
}

impl TrimmableRegistryImpl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrants that have not been dropped yet.
    pub fn live_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Deliver `trim_type` to every live registrant.
    ///
    /// Registrants are upgraded under the lock and trimmed after it is
    /// released, so a trimmable may (un)register from inside `trim`.
    pub fn trim_all(&self, trim_type: MemoryTrimType) {
        let live: Vec<_> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|w| w.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        for trimmable in live {
            trimmable.trim(trim_type);
        }
    }
}

impl MemoryTrimmableRegistry for TrimmableRegistryImpl {
    fn register_memory_trimmable(&self, trimmable: Weak<dyn MemoryTrimmable>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(trimmable);
    }

    fn unregister_memory_trimmable(&self, trimmable: &Weak<dyn MemoryTrimmable>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|w| !Weak::ptr_eq(w, trimmable));
    }
}
