#![forbid(unsafe_code)]
//! imgpool-mem: bucketed, capped pools for image-pipeline memory.
//!
//! Every pool is a [`BasePool`] over a [`PoolAllocator`]. The pool keeps free
//! values in per-size buckets, enforces a soft cap (trim free values) and a
//! hard cap (fail the request), and reports through a [`PoolStatsTracker`].
//! Native chunks back immutable [`PooledBuffer`]s and growable output
//! streams. Hosts drive memory pressure through the trimmable registry from
//! `imgpool-core`.

mod trace;

pub mod bitmap;
pub mod bucket;
pub mod buffer;
pub mod byte_array;
pub mod chunk;
pub mod chunk_pool;
pub mod counter;
pub mod error;
pub mod factory;
pub mod pool;
pub mod shared;
pub mod stats;
pub mod stream;
pub mod streams;
pub mod tracking;

pub use bitmap::{Bitmap, BitmapCounter, BitmapPool};
pub use bucket::{Bucket, BucketKind};
pub use buffer::{PooledBuffer, PooledBufferInputStream};
pub use byte_array::{FlexByteArrayPool, GenericByteArrayPool, SoftRefByteArrayPool};
pub use chunk::NativeMemoryChunk;
pub use chunk_pool::NativeMemoryChunkPool;
pub use counter::Counter;
pub use error::{Error, Result};
pub use factory::{PoolFactory, PoolTrackers, PooledBufferFactory};
pub use pool::{BasePool, PoolAllocator, PoolValue};
pub use shared::SharedByteArray;
pub use stats::{NoOpPoolStatsTracker, PoolStatsSource, PoolStatsTracker};
pub use stream::PooledBufferOutputStream;
pub use streams::PooledByteStreams;
pub use tracking::{PeakUsageTracker, UsageCounts};
