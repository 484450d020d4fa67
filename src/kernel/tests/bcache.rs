//! Behavioral tests for the block buffer cache.

mod helpers;

use std::thread;

use helpers::cache_with_disk;
use lohko_common::error::DeviceError;
use lohko_common::ids::{BlockNo, DeviceId};
use lohko_hal::BlockDevice;

const DEV: DeviceId = DeviceId(1);

#[test]
fn hits_are_served_without_touching_the_device() {
    let (cache, disk) = cache_with_disk(2, 2);

    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    assert!(handle.iter().all(|&b| b == 0));
    cache.release(handle);
    assert_eq!(disk.reads(), 1);

    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    cache.release(handle);
    assert_eq!(disk.reads(), 1);
}

#[test]
fn writes_persist_and_survive_eviction() {
    let (cache, disk) = cache_with_disk(2, 2);

    let mut handle = cache.read(DEV, BlockNo(3)).unwrap();
    handle.fill(0xAB);
    cache.write(&handle).unwrap();
    cache.release(handle);
    assert_eq!(disk.writes(), 1);
    assert!(disk.block(DEV, BlockNo(3)).unwrap().iter().all(|&b| b == 0xAB));

    // Push four other blocks through the four slots so block 3 is evicted.
    for b in 20..24 {
        let handle = cache.read(DEV, BlockNo(b)).unwrap();
        cache.release(handle);
    }

    // The refetched copy must equal what was written out.
    let reads_before = disk.reads();
    let handle = cache.read(DEV, BlockNo(3)).unwrap();
    assert!(handle.iter().all(|&b| b == 0xAB));
    cache.release(handle);
    assert_eq!(disk.reads(), reads_before + 1);
}

#[test]
fn eviction_recycles_the_least_recently_used_slot() {
    let (cache, disk) = cache_with_disk(2, 2);

    // Fill all four slots; install order fixes the recency order.
    for b in [10, 11, 12, 13] {
        let handle = cache.read(DEV, BlockNo(b)).unwrap();
        cache.release(handle);
    }
    assert_eq!(disk.reads(), 4);

    // A fifth block must displace block 10, the oldest, and nothing else.
    let handle = cache.read(DEV, BlockNo(14)).unwrap();
    cache.release(handle);
    assert_eq!(disk.reads(), 5);

    let handle = cache.read(DEV, BlockNo(11)).unwrap();
    cache.release(handle);
    assert_eq!(disk.reads(), 5, "block 11 should still be cached");

    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    cache.release(handle);
    assert_eq!(disk.reads(), 6, "block 10 should have been evicted");
}

#[test]
#[should_panic(expected = "slot count overflows")]
fn absurd_capacities_fail_fast() {
    let _ = cache_with_disk(usize::MAX, 2);
}

#[test]
#[should_panic(expected = "out of buffer slots")]
fn referencing_more_blocks_than_slots_is_fatal() {
    let (cache, _disk) = cache_with_disk(2, 2);

    // Four slots, four referenced blocks: fine.
    let held: Vec<_> = (10..14).map(|b| cache.acquire(DEV, BlockNo(b))).collect();
    assert_eq!(held.len(), 4);

    // A fifth referenced block exceeds the configured capacity.
    let _ = cache.acquire(DEV, BlockNo(14));
}

#[test]
fn pinned_blocks_survive_eviction_pressure() {
    let (cache, disk) = cache_with_disk(2, 2);

    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    cache.pin(&handle);
    cache.release(handle);
    let reads_after_pin = disk.reads();

    // Six misses cycle through the three unpinned slots.
    for b in 20..26 {
        let handle = cache.read(DEV, BlockNo(b)).unwrap();
        cache.release(handle);
    }

    // Still resident: no refetch.
    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    assert_eq!(disk.reads(), reads_after_pin + 6);
    cache.unpin(&handle);
    cache.release(handle);

    // Unpinned, the block is ordinary eviction fodder again.
    for b in 30..36 {
        let handle = cache.read(DEV, BlockNo(b)).unwrap();
        cache.release(handle);
    }
    let reads_before = disk.reads();
    let handle = cache.read(DEV, BlockNo(10)).unwrap();
    cache.release(handle);
    assert_eq!(disk.reads(), reads_before + 1);
}

#[test]
fn device_errors_propagate_and_do_not_leak_the_slot() {
    let (cache, disk) = cache_with_disk(2, 2);

    disk.set_failing(true);
    assert_eq!(cache.read(DEV, BlockNo(5)).err(), Some(DeviceError::Io));

    // The slot taken for the failed read must still be recyclable: all four
    // slots can be referenced at once afterwards.
    disk.set_failing(false);
    let held: Vec<_> = (10..14).map(|b| cache.read(DEV, BlockNo(b)).unwrap()).collect();
    for handle in held {
        cache.release(handle);
    }

    let handle = cache.read(DEV, BlockNo(5)).unwrap();
    assert!(handle.iter().all(|&b| b == 0));
    cache.release(handle);
}

#[test]
fn content_lock_serializes_all_users_of_a_block() {
    let (cache, _disk) = cache_with_disk(2, 2);
    let threads = 8u64;
    let per_thread = 200u64;

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..per_thread {
                    let mut handle = cache.read(DEV, BlockNo(7)).unwrap();
                    let counter = u64::from_le_bytes(handle[..8].try_into().unwrap());
                    handle[..8].copy_from_slice(&(counter + 1).to_le_bytes());
                    cache.release(handle);
                }
            });
        }
    });

    let handle = cache.read(DEV, BlockNo(7)).unwrap();
    let counter = u64::from_le_bytes(handle[..8].try_into().unwrap());
    cache.release(handle);
    assert_eq!(counter, threads * per_thread);
}

#[test]
fn concurrent_misses_for_one_block_install_a_single_copy() {
    let (cache, disk) = cache_with_disk(4, 2);
    disk.write_block(DEV, BlockNo(42), &[0x2A; lohko_kernel::bcache::BLOCK_SIZE])
        .unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let handle = cache.read(DEV, BlockNo(42)).unwrap();
                assert!(handle.iter().all(|&b| b == 0x2A));
                cache.release(handle);
            });
        }
    });

    // Were two slots ever bound to the block, at least two reads would show.
    assert_eq!(disk.reads(), 1);
}

#[test]
fn unrelated_blocks_do_not_serialize_on_each_other() {
    let (cache, disk) = cache_with_disk(4, 2);

    thread::scope(|s| {
        for t in 0..4u32 {
            let cache = &cache;
            s.spawn(move || {
                for _ in 0..100 {
                    let mut handle = cache.read(DEV, BlockNo(t)).unwrap();
                    handle.fill(t as u8);
                    cache.release(handle);
                }
            });
        }
    });

    for t in 0..4u32 {
        let handle = cache.read(DEV, BlockNo(t)).unwrap();
        assert!(handle.iter().all(|&b| b == t as u8));
        cache.release(handle);
    }
    assert_eq!(disk.reads(), 4);
}
