//! Convenient re-exports for downstream crates.

pub use crate::config::{BucketLayout, PoolConfig, PoolParams};
pub use crate::error::{Error, Result};
pub use crate::id::{BitmapId, ChunkId};
pub use crate::memory::{
    MemoryTrimType, MemoryTrimmable, MemoryTrimmableRegistry, NoOpMemoryTrimmableRegistry,
    TrimmableRegistryImpl,
};
pub use crate::reference::{CloseableReference, ResourceReleaser, SharedReference};
pub use crate::units::{KB, MB};
