//! Pool configuration defaults, env overrides, and the pool factory.

use imgpool_core::config::{defaults, BucketLayout, PoolConfig, PoolParams};
use imgpool_core::units::{KB, MB};
use imgpool_mem::{PeakUsageTracker, PoolFactory, PoolStatsTracker, PoolTrackers};
use std::sync::Arc;

#[test]
fn test_default_params_scale_with_memory() {
    let small = PoolConfig::for_memory(8 * MB, 2);
    assert_eq!(small.bitmap_pool.max_size_hard_cap, 4 * MB);
    assert_eq!(small.native_memory_chunk_pool.max_size_soft_cap, 3 * MB);
    assert_eq!(small.native_memory_chunk_pool.max_size_hard_cap, 4 * MB);

    let medium = PoolConfig::for_memory(24 * MB, 2);
    assert_eq!(medium.native_memory_chunk_pool.max_size_soft_cap, 6 * MB);
    assert_eq!(medium.bitmap_pool.max_size_hard_cap, 18 * MB);

    let large = PoolConfig::for_memory(256 * MB, 8);
    assert_eq!(large.native_memory_chunk_pool.max_size_soft_cap, 50 * MB);
    assert_eq!(large.native_memory_chunk_pool.max_size_hard_cap, 192 * MB);
    assert_eq!(large.flex_byte_array_pool.max_size_hard_cap, 8 * 4 * MB);
    assert_eq!(large.flex_byte_array_pool.max_num_threads, Some(8));

    for config in [small, medium, large] {
        config.validate().expect("Defaults must validate");
    }
}

#[test]
fn test_bucket_tables() {
    let native = defaults::native_memory_chunk_pool_params(64 * MB);
    let table = native.bucket_sizes.as_ref().expect("Native pool has buckets");
    assert_eq!(table.len(), 11);
    assert_eq!(table[&KB], defaults::SMALL_BUCKET_LENGTH);
    assert_eq!(table[&MB], defaults::LARGE_BUCKET_LENGTH);

    let small = defaults::small_byte_array_pool_params();
    assert_eq!(small.max_size_soft_cap, 80 * KB);
    assert_eq!(small.bucket_size_keys(), vec![16 * KB]);

    let flex = defaults::flex_byte_array_pool_params(3);
    assert_eq!(
        flex.bucket_size_keys(),
        vec![128 * KB, 256 * KB, 512 * KB, MB, 2 * MB, 4 * MB]
    );
    assert!(flex.bucket_sizes.expect("Flex has buckets").values().all(|&len| len == 3));

    assert_eq!(defaults::bitmap_pool_params(64 * MB).bucket_layout(), BucketLayout::Dynamic);
    let empty = PoolParams::with_caps(10, 10, Some(Default::default())).expect("Invalid params");
    assert_eq!(empty.bucket_layout(), BucketLayout::Dynamic);
}

#[test]
fn test_params_validation() {
    assert!(PoolParams::with_caps(100, 50, None).is_err());
    assert!(PoolParams::new(10, 10, None, 64, 32, None).is_err());
    assert!(PoolParams::with_max_size(10, Some([(0, 1)].into_iter().collect())).is_err());
    assert!(PoolParams::with_max_size(10, None).is_ok());
}

#[test]
fn test_config_json_roundtrip() {
    let config = PoolConfig::for_memory(64 * MB, 4);
    let json = config.to_json().expect("Serialization failed");
    assert!(json.contains("native_memory_chunk_pool"));
    let parsed: PoolConfig = serde_json::from_str(&json).expect("Deserialization failed");
    assert_eq!(parsed, config);
}

#[test]
fn test_config_from_env_overrides() {
    // The only test in this binary touching these variables.
    std::env::set_var("IMGPOOL_MAX_MEMORY_BYTES", (64 * MB).to_string());
    std::env::set_var("IMGPOOL_MAX_NUM_THREADS", "3");
    std::env::set_var("IMGPOOL_NATIVE_SOFT_CAP", (60 * MB).to_string());
    std::env::set_var("IMGPOOL_NATIVE_HARD_CAP", (10 * MB).to_string());
    std::env::set_var("IMGPOOL_BITMAP_HARD_CAP", (5 * MB).to_string());

    let config = PoolConfig::from_env();

    for name in [
        "IMGPOOL_MAX_MEMORY_BYTES",
        "IMGPOOL_MAX_NUM_THREADS",
        "IMGPOOL_NATIVE_SOFT_CAP",
        "IMGPOOL_NATIVE_HARD_CAP",
        "IMGPOOL_BITMAP_HARD_CAP",
    ] {
        std::env::remove_var(name);
    }

    assert_eq!(config.max_memory_bytes, 64 * MB);
    assert_eq!(config.flex_byte_array_pool.max_num_threads, Some(3));
    assert_eq!(config.bitmap_pool.max_size_hard_cap, 5 * MB);
    // An inverted pair is clamped down to the hard cap.
    assert_eq!(config.native_memory_chunk_pool.max_size_hard_cap, 10 * MB);
    assert_eq!(config.native_memory_chunk_pool.max_size_soft_cap, 10 * MB);
    config.validate().expect("Env config must validate");
}

#[test]
fn test_factory_reuses_pools_and_trackers() {
    let tracker = Arc::new(PeakUsageTracker::new());
    let native: Arc<dyn PoolStatsTracker> = tracker.clone();
    let trackers = PoolTrackers {
        native_memory_chunk: native,
        ..PoolTrackers::default()
    };
    let factory = PoolFactory::with_registry(
        PoolConfig::for_memory(64 * MB, 2),
        Arc::new(imgpool_core::memory::NoOpMemoryTrimmableRegistry),
        trackers,
    )
    .expect("Factory creation failed");

    let buffers = factory.pooled_buffer_factory().expect("Buffer factory");
    let buffer = buffers.from_bytes(&[7u8; 3000]).expect("Buffer creation failed");
    assert_eq!(buffer.size().expect("Buffer closed"), 3000);
    assert_eq!(tracker.alloc_count(), 1);
    assert_eq!(tracker.peak(), 4 * KB);

    assert!(Arc::ptr_eq(
        factory.native_memory_chunk_pool().expect("Native pool"),
        buffers.pool()
    ));
    assert!(Arc::ptr_eq(
        factory.small_byte_array_pool().expect("Small pool"),
        factory.small_byte_array_pool().expect("Small pool")
    ));
    assert_eq!(
        factory.pooled_byte_streams().expect("Streams").temp_buf_size(),
        defaults::DEFAULT_IO_BUFFER_SIZE
    );
    assert_eq!(factory.bitmap_counter().expect("Counter").max_count(), 384);
    let flex = factory.flex_byte_array_pool().expect("Flex pool");
    assert_eq!(flex.min_buffer_size(), 128 * KB);
}

#[test]
fn test_factory_rejects_invalid_config() {
    let mut config = PoolConfig::for_memory(64 * MB, 2);
    config.small_byte_array_pool.max_size_hard_cap = 0;
    assert!(PoolFactory::new(config).is_err());
}
