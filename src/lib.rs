#![forbid(unsafe_code)]
//! imgpool: bounded-memory resource pools for image pipelines.
//!
//! Re-exports the member crates so that hosts and the integration tests can
//! depend on a single package.

pub use imgpool_core;
pub use imgpool_mem;

pub mod prelude {
    pub use imgpool_core::prelude::*;
    pub use imgpool_mem::{
        BasePool, Bitmap, BitmapCounter, BitmapPool, FlexByteArrayPool, GenericByteArrayPool,
        NativeMemoryChunk, NativeMemoryChunkPool, NoOpPoolStatsTracker, PeakUsageTracker,
        PoolFactory, PoolStatsTracker, PooledBuffer, PooledBufferFactory,
        PooledBufferOutputStream, PooledByteStreams, SharedByteArray,
    };
}
