//! BasePool behaviour through the byte-array pool: reuse, caps, trims and
//! counter conservation.

use imgpool_core::config::PoolParams;
use imgpool_core::memory::{MemoryTrimType, MemoryTrimmable, NoOpMemoryTrimmableRegistry};
use imgpool_mem::stats::keys;
use imgpool_mem::{
    Error, GenericByteArrayPool, NoOpPoolStatsTracker, PeakUsageTracker, PoolStatsSource,
    PoolValue,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

fn byte_pool(soft: usize, hard: usize, table: &[(usize, usize)]) -> Arc<GenericByteArrayPool> {
    let buckets: Option<BTreeMap<usize, usize>> = if table.is_empty() {
        None
    } else {
        Some(table.iter().copied().collect())
    };
    let params = PoolParams::with_caps(soft, hard, buckets).expect("Invalid params");
    GenericByteArrayPool::new(
        params,
        &NoOpMemoryTrimmableRegistry,
        Arc::new(NoOpPoolStatsTracker),
    )
    .expect("Pool creation failed")
}

#[test]
fn test_reuse_returns_same_array() {
    let pool = byte_pool(5 * 16384, 1024 * 1024, &[(16384, 5)]);

    let a = pool.get(16384).expect("Get failed");
    let identity = a.identity();
    pool.release(a);

    let b = pool.get(16384).expect("Get failed");
    assert_eq!(b.identity(), identity, "Expected the released array back");
    assert_eq!(pool.used_counter().num_bytes, 16384);
    assert_eq!(pool.free_counter().num_bytes, 0);
}

#[test]
fn test_invalid_size() {
    let pool = byte_pool(1024, 1024, &[]);
    assert!(matches!(pool.get(0), Err(Error::InvalidSize { size: 0 })));
    assert_eq!(pool.used_counter().count, 0);
}

#[test]
fn test_hard_cap_rejects_even_empty_pool() {
    let pool = byte_pool(1024, 1024, &[]);

    match pool.get(2048) {
        Err(Error::PoolSizeViolation {
            hard_cap,
            used,
            free,
            requested,
        }) => {
            assert_eq!(hard_cap, 1024);
            assert_eq!(used, 0);
            assert_eq!(free, 0);
            assert_eq!(requested, 2048);
        }
        other => panic!("Expected a pool size violation, got {:?}", other),
    }

    let _held = pool.get(800).expect("Get failed");
    assert!(matches!(
        pool.get(300),
        Err(Error::PoolSizeViolation { .. })
    ));
    assert_eq!(pool.used_counter().num_bytes, 800);
}

#[test]
fn test_bucketed_size_is_monotonic() {
    let pool = byte_pool(
        1024 * 1024,
        4 * 1024 * 1024,
        &[(64, 4), (256, 4), (1024, 4)],
    );

    let mut previous = 0;
    for size in (1..3000).step_by(37) {
        let bucketed = pool.bucketed_size(size).expect("Bucketed size failed");
        assert!(bucketed >= size);
        assert!(bucketed >= previous, "Bucketing must never shrink");
        previous = bucketed;

        let array = pool.get(size).expect("Get failed");
        assert!(array.len() >= bucketed);
        pool.release(array);
    }
}

#[test]
fn test_allocation_over_soft_cap_trims_smallest_first() {
    let pool = byte_pool(100, 1000, &[(10, 20), (20, 20)]);

    let twenties: Vec<_> = (0..4).map(|_| pool.get(20).expect("Get failed")).collect();
    let tens: Vec<_> = (0..2).map(|_| pool.get(10).expect("Get failed")).collect();
    assert_eq!(pool.used_counter().num_bytes, 100);

    for a in tens.into_iter().chain(twenties) {
        pool.release(a);
    }
    assert_eq!(pool.used_counter().num_bytes, 0);
    assert_eq!(pool.free_counter().num_bytes, 100);

    // An unbucketed 30-byte request must leave room by freeing 30 bytes:
    // both tens first, then one twenty.
    let _big = pool.get(30).expect("Get failed");
    assert_eq!(pool.used_counter().num_bytes, 30);
    assert_eq!(pool.free_counter().count, 3);
    assert_eq!(pool.free_counter().num_bytes, 60);
}

#[test]
fn test_release_over_soft_cap_frees() {
    let pool = byte_pool(50, 1000, &[(20, 10)]);

    let mut held: Vec<_> = (0..3).map(|_| pool.get(20).expect("Get failed")).collect();
    assert!(pool.is_max_size_soft_cap_exceeded());
    pool.trim_to_soft_cap();
    assert_eq!(pool.free_counter().num_bytes, 0);

    // 60 bytes in use is over the cap of 50, so this one is freed.
    pool.release(held.pop().expect("Missing array"));
    assert_eq!(pool.used_counter().num_bytes, 40);
    assert_eq!(pool.free_counter().num_bytes, 0);

    // Back under the cap: kept for reuse.
    pool.release(held.pop().expect("Missing array"));
    assert_eq!(pool.used_counter().num_bytes, 20);
    assert_eq!(pool.free_counter().num_bytes, 20);
}

#[test]
fn test_bucket_max_length_limits_free_list() {
    let pool = byte_pool(1024, 1024, &[(16, 2)]);

    let arrays: Vec<_> = (0..3).map(|_| pool.get(16).expect("Get failed")).collect();
    for a in arrays {
        pool.release(a);
    }
    // Three out of a max length of two: the first release frees, the
    // other two are kept.
    assert_eq!(pool.free_counter().count, 2);
    assert_eq!(pool.used_counter().count, 0);
}

#[test]
fn test_full_trim_keeps_used_bytes() {
    let pool = byte_pool(4096, 8192, &[(128, 8), (512, 8)]);

    let held = pool.get(500).expect("Get failed");
    let released: Vec<_> = (0..4).map(|_| pool.get(100).expect("Get failed")).collect();
    for a in released {
        pool.release(a);
    }
    let before = pool.stats();
    assert_eq!(before[keys::FREE_BYTES], 4 * 128);
    assert_eq!(before[keys::USED_BYTES], 512);

    pool.trim(MemoryTrimType::OnCloseToHeapLimit);

    let after = pool.stats();
    assert_eq!(after[keys::FREE_BYTES], 0);
    assert_eq!(after[keys::FREE_COUNT], 0);
    assert_eq!(after[keys::USED_BYTES], 512);
    assert_eq!(after[&keys::buckets_used(512)], 1);

    // The held array still returns to its bucket after the trim.
    pool.release(held);
    assert_eq!(pool.free_counter().num_bytes, 512);
    assert_eq!(pool.stats()[&keys::buckets_used(512)], 0);
}

#[test]
fn test_dynamic_buckets_created_on_demand() {
    let pool = byte_pool(4096, 8192, &[]);

    let a = pool.get(300).expect("Get failed");
    assert_eq!(a.len(), 300);
    let identity = a.identity();
    pool.release(a);
    assert_eq!(pool.stats()[&keys::buckets_used(300)], 0);

    let b = pool.get(300).expect("Get failed");
    assert_eq!(b.identity(), identity);
}

#[test]
fn test_unrecognized_release_is_freed() {
    let pool = byte_pool(1024, 1024, &[(16, 4)]);
    let _held = pool.get(16).expect("Get failed");

    pool.release(vec![0u8; 16]);
    assert_eq!(pool.used_counter().num_bytes, 16);
    assert_eq!(pool.free_counter().num_bytes, 0);
}

#[test]
fn test_stats_keys() {
    let pool = byte_pool(1000, 2000, &[(8, 2), (32, 2)]);
    let _a = pool.get(8).expect("Get failed");
    let b = pool.get(20).expect("Get failed");
    pool.release(b);

    let stats = pool.stats();
    assert_eq!(stats[keys::SOFT_CAP], 1000);
    assert_eq!(stats[keys::HARD_CAP], 2000);
    assert_eq!(stats[keys::USED_COUNT], 1);
    assert_eq!(stats[keys::USED_BYTES], 8);
    assert_eq!(stats[keys::FREE_COUNT], 1);
    assert_eq!(stats[keys::FREE_BYTES], 32);
    assert_eq!(stats["buckets_used_8"], 1);
    assert_eq!(stats["buckets_used_32"], 0);
}

#[test]
fn test_tracker_sees_pool_events() {
    let tracker = Arc::new(PeakUsageTracker::new());
    let params = PoolParams::with_caps(20, 1000, Some([(10, 5)].into_iter().collect()))
        .expect("Invalid params");
    let pool = GenericByteArrayPool::new(params, &NoOpMemoryTrimmableRegistry, tracker.clone())
        .expect("Pool creation failed");

    let a = pool.get(10).expect("Get failed");
    let b = pool.get(10).expect("Get failed");
    let c = pool.get(10).expect("Get failed");
    assert!(pool.get(2000).is_err());
    pool.release(a);
    pool.release(b);
    pool.release(c);
    let _again = pool.get(10).expect("Get failed");

    let counts = tracker.counts();
    assert_eq!(counts.allocs, 3);
    assert_eq!(counts.reuses, 1);
    assert_eq!(counts.peak_bytes, 30);
    assert!(counts.hard_cap_hits >= 1);
    assert!(counts.soft_cap_hits >= 1);
    // 30 used > 20 on the first release, so it frees; the other two are kept.
    assert_eq!(counts.frees, 1);
    assert_eq!(counts.releases, 2);

    let stats = tracker.pool_stats().expect("Pool should still be alive");
    assert_eq!(stats[keys::USED_BYTES], 10);
    drop(pool);
    assert!(tracker.pool_stats().is_none());
}

#[test]
fn test_concurrent_get_release_conserves_counters() {
    let pool = byte_pool(64 * 1024, 1024 * 1024, &[(64, 16), (256, 16), (1024, 16)]);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..500 {
                    let size = 1 + (i * 31 + t * 17) % 1024;
                    let mut array = pool.get(size).expect("Get failed");
                    array[0] = t as u8;
                    pool.release(array);
                    if i % 100 == 0 {
                        pool.trim_to_soft_cap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Worker panicked");
    }

    let stats = pool.stats();
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(stats[keys::USED_BYTES], 0);
    assert_eq!(stats[keys::USED_COUNT], 0);
    for size in [64, 256, 1024] {
        assert_eq!(stats[&keys::buckets_used(size)], 0);
    }
    assert!(stats[keys::FREE_COUNT] <= 48);

    pool.trim_to_nothing();
    assert_eq!(pool.free_counter().num_bytes, 0);
}
