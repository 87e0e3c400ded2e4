//! Pool parameters and configuration that hosts can serialize/deserialize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::units::{KB, MB};

/// Parameters of one pool.
///
/// The soft cap triggers trimming of free values but never fails an
/// allocation. The hard cap fails allocations once reached. `bucket_sizes`
/// maps a bucketed size to that bucket's max length (in-use plus free); when
/// it is `None` or empty the pool creates buckets on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    pub max_size_soft_cap: usize,
    pub max_size_hard_cap: usize,
    pub bucket_sizes: Option<BTreeMap<usize, usize>>,
    /// Every bucket can hold a value of at most this size or less.
    pub min_bucket_size: usize,
    /// Requests above this size are rejected by pools that honour it.
    pub max_bucket_size: usize,
    /// Max number of threads expected to touch the pool. `None` when the pool
    /// does not care.
    pub max_num_threads: Option<usize>,
}

impl PoolParams {
    pub fn new(
        max_size_soft_cap: usize,
        max_size_hard_cap: usize,
        bucket_sizes: Option<BTreeMap<usize, usize>>,
        min_bucket_size: usize,
        max_bucket_size: usize,
        max_num_threads: Option<usize>,
    ) -> Result<Self> {
        let params = Self {
            max_size_soft_cap,
            max_size_hard_cap,
            bucket_sizes,
            min_bucket_size,
            max_bucket_size,
            max_num_threads,
        };
        params.validate()?;
        Ok(params)
    }

    /// Same soft and hard cap.
    pub fn with_max_size(max_size: usize, bucket_sizes: Option<BTreeMap<usize, usize>>) -> Result<Self> {
        Self::with_caps(max_size, max_size, bucket_sizes)
    }

    pub fn with_caps(
        max_size_soft_cap: usize,
        max_size_hard_cap: usize,
        bucket_sizes: Option<BTreeMap<usize, usize>>,
    ) -> Result<Self> {
        Self::new(
            max_size_soft_cap,
            max_size_hard_cap,
            bucket_sizes,
            0,
            usize::MAX,
            None,
        )
    }

    /// Check the cross-field constraints. Deserialized params should be
    /// validated before use.
    pub fn validate(&self) -> Result<()> {
        if self.max_size_hard_cap < self.max_size_soft_cap {
            return Err(Error::Config(format!(
                "hard cap {} is below soft cap {}",
                self.max_size_hard_cap, self.max_size_soft_cap
            )));
        }
        if self.max_bucket_size < self.min_bucket_size {
            return Err(Error::Config(format!(
                "max bucket size {} is below min bucket size {}",
                self.max_bucket_size, self.min_bucket_size
            )));
        }
        if let Some(buckets) = &self.bucket_sizes {
            if buckets.contains_key(&0) {
                return Err(Error::Config("bucket size 0 is not allowed".into()));
            }
        }
        Ok(())
    }

    pub fn bucket_layout(&self) -> BucketLayout {
        match &self.bucket_sizes {
            Some(table) if !table.is_empty() => BucketLayout::Fixed(table.clone()),
            _ => BucketLayout::Dynamic,
        }
    }

    /// Configured bucket sizes, ascending.
    pub fn bucket_size_keys(&self) -> Vec<usize> {
        self.bucket_sizes
            .as_ref()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// How a pool's buckets come into existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketLayout {
    /// Exactly these buckets (size to max length). Other sizes are plain
    /// alloc/free and never pooled.
    Fixed(BTreeMap<usize, usize>),
    /// A bucket is created on the first request for a size.
    Dynamic,
}

/// Default host memory limit when none is configured.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 512 * MB;

/// Default parameters for each pool, derived from the host memory limit.
pub mod defaults {
    use super::*;

    pub const SMALL_BUCKET_LENGTH: usize = 5;
    pub const LARGE_BUCKET_LENGTH: usize = 2;
    pub const DEFAULT_IO_BUFFER_SIZE: usize = 16 * KB;
    pub const DEFAULT_MIN_BYTE_ARRAY_SIZE: usize = 128 * KB;
    pub const DEFAULT_MAX_BYTE_ARRAY_SIZE: usize = 4 * MB;

    pub fn default_num_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Bitmaps: no soft cap (every release frees unless in use), hard cap a
    /// share of host memory, buckets created on demand.
    pub fn bitmap_pool_params(max_memory: usize) -> PoolParams {
        let hard_cap = if max_memory > 16 * MB {
            max_memory / 4 * 3
        } else {
            max_memory / 2
        };
        PoolParams {
            max_size_soft_cap: 0,
            max_size_hard_cap: hard_cap,
            bucket_sizes: None,
            min_bucket_size: 0,
            max_bucket_size: usize::MAX,
            max_num_threads: None,
        }
    }

    pub fn native_memory_chunk_pool_params(max_memory: usize) -> PoolParams {
        let mut buckets = BTreeMap::new();
        for size_kb in [1, 2, 4, 8, 16, 32, 64, 128] {
            buckets.insert(size_kb * KB, SMALL_BUCKET_LENGTH);
        }
        for size_kb in [256, 512, 1024] {
            buckets.insert(size_kb * KB, LARGE_BUCKET_LENGTH);
        }
        let soft_cap = if max_memory < 16 * MB {
            3 * MB
        } else if max_memory < 32 * MB {
            6 * MB
        } else {
            50 * MB
        };
        let hard_cap = if max_memory < 16 * MB {
            max_memory / 2
        } else {
            max_memory / 4 * 3
        };
        PoolParams {
            max_size_soft_cap: soft_cap,
            max_size_hard_cap: hard_cap.max(soft_cap),
            bucket_sizes: Some(buckets),
            min_bucket_size: 0,
            max_bucket_size: usize::MAX,
            max_num_threads: None,
        }
    }

    /// One bucket of IO-sized buffers.
    pub fn small_byte_array_pool_params() -> PoolParams {
        let mut buckets = BTreeMap::new();
        buckets.insert(DEFAULT_IO_BUFFER_SIZE, SMALL_BUCKET_LENGTH);
        PoolParams {
            max_size_soft_cap: SMALL_BUCKET_LENGTH * DEFAULT_IO_BUFFER_SIZE,
            max_size_hard_cap: MB,
            bucket_sizes: Some(buckets),
            min_bucket_size: 0,
            max_bucket_size: usize::MAX,
            max_num_threads: None,
        }
    }

    /// Power-of-two buckets from `min` to `max`, each `num_threads` long.
    pub fn generate_buckets(min: usize, max: usize, num_threads: usize) -> BTreeMap<usize, usize> {
        let mut buckets = BTreeMap::new();
        let mut size = min.max(1);
        while size <= max {
            buckets.insert(size, num_threads);
            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }
        buckets
    }

    pub fn flex_byte_array_pool_params(num_threads: usize) -> PoolParams {
        let num_threads = num_threads.max(1);
        PoolParams {
            max_size_soft_cap: DEFAULT_MAX_BYTE_ARRAY_SIZE,
            max_size_hard_cap: num_threads * DEFAULT_MAX_BYTE_ARRAY_SIZE,
            bucket_sizes: Some(generate_buckets(
                DEFAULT_MIN_BYTE_ARRAY_SIZE,
                DEFAULT_MAX_BYTE_ARRAY_SIZE,
                num_threads,
            )),
            min_bucket_size: DEFAULT_MIN_BYTE_ARRAY_SIZE,
            max_bucket_size: DEFAULT_MAX_BYTE_ARRAY_SIZE,
            max_num_threads: Some(num_threads),
        }
    }
}

/// Parameters for every pool the factory can build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Host memory limit the defaults were derived from.
    pub max_memory_bytes: usize,
    pub bitmap_pool: PoolParams,
    pub native_memory_chunk_pool: PoolParams,
    pub small_byte_array_pool: PoolParams,
    pub flex_byte_array_pool: PoolParams,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_memory(DEFAULT_MAX_MEMORY_BYTES, defaults::default_num_threads())
    }
}

impl PoolConfig {
    /// Defaults for a host with `max_memory_bytes` and `num_threads` workers.
    pub fn for_memory(max_memory_bytes: usize, num_threads: usize) -> Self {
        Self {
            max_memory_bytes,
            bitmap_pool: defaults::bitmap_pool_params(max_memory_bytes),
            native_memory_chunk_pool: defaults::native_memory_chunk_pool_params(max_memory_bytes),
            small_byte_array_pool: defaults::small_byte_array_pool_params(),
            flex_byte_array_pool: defaults::flex_byte_array_pool_params(num_threads),
        }
    }

    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `IMGPOOL_MAX_MEMORY_BYTES`: host memory limit the defaults derive from
    /// - `IMGPOOL_MAX_NUM_THREADS`: threads sharing the flex byte-array pool
    /// - `IMGPOOL_BITMAP_HARD_CAP`: bitmap pool hard cap
    /// - `IMGPOOL_NATIVE_SOFT_CAP`: native chunk pool soft cap
    /// - `IMGPOOL_NATIVE_HARD_CAP`: native chunk pool hard cap
    pub fn from_env() -> Self {
        let max_memory = env_usize("IMGPOOL_MAX_MEMORY_BYTES").unwrap_or(DEFAULT_MAX_MEMORY_BYTES);
        let threads =
            env_usize("IMGPOOL_MAX_NUM_THREADS").unwrap_or_else(defaults::default_num_threads);
        let mut cfg = Self::for_memory(max_memory, threads);

        if let Some(v) = env_usize("IMGPOOL_BITMAP_HARD_CAP") {
            cfg.bitmap_pool.max_size_hard_cap = v;
        }

        if let Some(v) = env_usize("IMGPOOL_NATIVE_SOFT_CAP") {
            cfg.native_memory_chunk_pool.max_size_soft_cap = v;
        }

        if let Some(v) = env_usize("IMGPOOL_NATIVE_HARD_CAP") {
            cfg.native_memory_chunk_pool.max_size_hard_cap = v;
        }

        // Env overrides may invert the caps; clamp rather than fail.
        let native = &mut cfg.native_memory_chunk_pool;
        if native.max_size_hard_cap < native.max_size_soft_cap {
            native.max_size_soft_cap = native.max_size_hard_cap;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        self.bitmap_pool.validate()?;
        self.native_memory_chunk_pool.validate()?;
        self.small_byte_array_pool.validate()?;
        self.flex_byte_array_pool.validate()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok())
}
