//! Sharded block buffer cache.
//!
//! Holds cached copies of disk-block contents so the filesystem rarely
//! touches the device, and serializes every user of a block behind that
//! block's content lock. The slot pool is partitioned into buckets keyed by
//! hashing the block number; each bucket has its own structural lock, so
//! threads working on unrelated blocks never contend. A miss recycles the
//! least-recently-used unreferenced slot across all buckets, coordinated by
//! one global lock.
//!
//! # Interface
//!
//! - [`BlockCache::read`] returns a locked handle with valid contents.
//! - [`BlockCache::write`] persists a handle's contents to the device.
//! - [`BlockCache::release`] gives a handle back when done.
//! - [`BlockCache::pin`] / [`BlockCache::unpin`] extend eviction protection
//!   across acquire/release cycles (used by the journal).
//!
//! Do not hold handles longer than necessary: only one thread at a time can
//! use a block.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use conquer_once::spin::OnceCell;
use log::{info, trace};
use spin::{Mutex, MutexGuard};

use crate::sync::{SleepLock, SleepLockGuard};
use lohko_common::error::DeviceError;
use lohko_common::ids::{BlockNo, DeviceId};
use lohko_hal::BlockDevice;

/// Size in bytes of one disk block.
pub const BLOCK_SIZE: usize = 1024;

/// Startup-time capacity of the cache.
///
/// Both counts are fixed for the kernel's lifetime; running out of slots at
/// runtime is treated as an undersized configuration, not a recoverable
/// condition.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of hash buckets the slot pool is sharded into.
    pub buckets: usize,
    /// Number of slots initially assigned to each bucket.
    pub slots_per_bucket: usize,
}

/// Index of a slot in the cache's fixed slot arena.
type SlotId = usize;

/// One cached block: recency metadata plus the content-locked payload.
///
/// The identity of the block a slot mirrors lives in the owning bucket's
/// entry, not here, so bucket membership and identity change together under
/// the bucket's lock. `refcount` and `tick` are written only while the
/// owning bucket's lock (and, for rebinding, the global lock) is held; the
/// atomics exist so the eviction scan can read them across buckets.
struct Slot {
    /// Number of active holders. Gates eviction only, never content access.
    refcount: AtomicU32,
    /// Recency stamp from the cache-wide counter. 0 = never used.
    tick: AtomicU64,
    /// Whether the payload reflects the contents of the bound block.
    valid: AtomicBool,
    /// The payload, serialized by its own long-term lock.
    data: SleepLock<[u8; BLOCK_SIZE]>,
}

impl Slot {
    fn new() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            tick: AtomicU64::new(0),
            valid: AtomicBool::new(false),
            data: SleepLock::new([0; BLOCK_SIZE]),
        }
    }
}

/// Membership entry: which slot currently mirrors which block.
#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: SlotId,
    dev: DeviceId,
    block: BlockNo,
}

/// One shard of the cache. Entries are kept in recency order, most recently
/// used first, and are only ever touched under the bucket's lock.
struct Bucket {
    entries: Vec<Entry>,
}

/// The sharded, content-locked cache of disk-block contents.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    /// Fixed arena of slots, addressed by `SlotId`.
    slots: Box<[Slot]>,
    buckets: Box<[Mutex<Bucket>]>,
    /// Serializes every operation that inspects or moves slots across more
    /// than one bucket. Lock order: this lock is always taken before any
    /// bucket lock within one call, and never while a bucket lock is held.
    global: Mutex<()>,
    /// Monotonic recency counter; the first stamp handed out is 1.
    ticks: AtomicU64,
}

impl BlockCache {
    /// Build a cache with the given fixed capacity, backed by `device`.
    ///
    /// Panics if either capacity count is zero or the total slot count
    /// overflows.
    pub fn new(config: CacheConfig, device: Arc<dyn BlockDevice>) -> Self {
        assert!(config.buckets > 0, "bcache: bucket count must be nonzero");
        assert!(
            config.slots_per_bucket > 0,
            "bcache: bucket capacity must be nonzero"
        );

        let total = config
            .buckets
            .checked_mul(config.slots_per_bucket)
            .expect("bcache: slot count overflows");
        let slots: Box<[Slot]> = (0..total).map(|_| Slot::new()).collect();
        let buckets: Box<[Mutex<Bucket>]> = (0..config.buckets)
            .map(|b| {
                let entries = (0..config.slots_per_bucket)
                    .map(|s| Entry {
                        slot: b * config.slots_per_bucket + s,
                        dev: DeviceId(0),
                        block: BlockNo(0),
                    })
                    .collect();
                Mutex::new(Bucket { entries })
            })
            .collect();

        info!("bcache: {} slots in {} buckets", total, config.buckets);
        Self {
            device,
            slots,
            buckets,
            global: Mutex::new(()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Total number of slots in the cache.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket_of(&self, block: BlockNo) -> usize {
        block.0 as usize % self.buckets.len()
    }

    fn next_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return a locked handle on the cached copy of `(dev, block)`.
    ///
    /// On a hit only the home bucket's lock is touched. On a miss the
    /// least-recently-used unreferenced slot anywhere in the cache is
    /// rebound to this block and its contents are marked invalid; use
    /// [`BlockCache::read`] to get contents that are guaranteed valid.
    ///
    /// Panics if every slot in the cache is referenced: the pool is sized
    /// at boot for the worst concurrent working set, so running dry is an
    /// unrecoverable configuration error.
    pub fn acquire(&self, dev: DeviceId, block: BlockNo) -> BlockHandle<'_> {
        let home = self.bucket_of(block);

        // Fast path: a single bucket lock.
        if let Some(slot) = self.lookup(home, dev, block) {
            return self.lock_slot(slot, dev, block);
        }

        // Miss. All cross-bucket work happens under the global lock, which
        // is taken while holding no bucket lock.
        let global = self.global.lock();

        // A concurrent miss for the same block may have installed it while
        // we held no lock at all; re-check before recycling a slot, or two
        // slots would end up bound to one block.
        if let Some(slot) = self.lookup(home, dev, block) {
            drop(global);
            return self.lock_slot(slot, dev, block);
        }

        let slot = self.evict_and_install(dev, block, home);
        drop(global);
        self.lock_slot(slot, dev, block)
    }

    /// Return a locked handle whose contents are valid.
    ///
    /// Fetches the block through the device primitive if the cached copy is
    /// stale or freshly recycled. Concurrent readers of *other* blocks are
    /// not delayed by the transfer; no structural lock is held across it.
    pub fn read(&self, dev: DeviceId, block: BlockNo) -> Result<BlockHandle<'_>, DeviceError> {
        let mut handle = self.acquire(dev, block);
        let slot = &self.slots[handle.slot];
        if !slot.valid.load(Ordering::Relaxed) {
            if let Err(e) = self.device.read_block(dev, block, &mut handle.guard[..]) {
                // Hand the slot back before surfacing the error so it stays
                // eviction-eligible.
                self.release(handle);
                return Err(e);
            }
            slot.valid.store(true, Ordering::Relaxed);
        }
        Ok(handle)
    }

    /// Persist the handle's contents through the device primitive.
    ///
    /// Holding the handle *is* holding the content lock, so the write
    /// cannot race with another user of the block.
    pub fn write(&self, handle: &BlockHandle<'_>) -> Result<(), DeviceError> {
        debug_assert!(
            self.slots[handle.slot].data.is_locked(),
            "bcache: write without content lock"
        );
        self.device.write_block(handle.dev, handle.block, &handle.guard[..])
    }

    /// Relinquish a handle.
    ///
    /// Releases the content lock, then drops the reference under the
    /// bucket's lock. The last releaser restamps the slot's recency and
    /// moves it to the most-recently-used position: freshly released
    /// blocks are the most likely to be wanted again, so they are the
    /// last to be evicted.
    pub fn release(&self, handle: BlockHandle<'_>) {
        let BlockHandle {
            guard, slot, block, ..
        } = handle;
        // Content lock first, then the structural lock; never both.
        drop(guard);

        let mut bucket = self.buckets[self.bucket_of(block)].lock();
        let prev = self.slots[slot].refcount.fetch_sub(1, Ordering::Relaxed);
        assert!(prev != 0, "bcache: release of unreferenced slot");
        if prev == 1 {
            self.slots[slot].tick.store(self.next_tick(), Ordering::Relaxed);
            let pos = bucket
                .entries
                .iter()
                .position(|e| e.slot == slot)
                .expect("bcache: slot missing from its bucket");
            let entry = bucket.entries.remove(pos);
            bucket.entries.insert(0, entry);
        }
    }

    /// Take an extra reference on the handle's slot, keeping it resident
    /// after the handle itself is released.
    ///
    /// List position is untouched; only eviction eligibility changes.
    pub fn pin(&self, handle: &BlockHandle<'_>) {
        let _bucket = self.buckets[self.bucket_of(handle.block)].lock();
        self.slots[handle.slot].refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference previously taken with [`BlockCache::pin`].
    pub fn unpin(&self, handle: &BlockHandle<'_>) {
        let _bucket = self.buckets[self.bucket_of(handle.block)].lock();
        let prev = self.slots[handle.slot].refcount.fetch_sub(1, Ordering::Relaxed);
        // The handle itself accounts for one reference.
        assert!(prev > 1, "bcache: unpin without matching pin");
    }

    /// Under `bucket`'s lock, find a cached copy of `(dev, block)` and take
    /// a reference on it.
    fn lookup(&self, bucket: usize, dev: DeviceId, block: BlockNo) -> Option<SlotId> {
        let guard = self.buckets[bucket].lock();
        let entry = guard
            .entries
            .iter()
            .find(|e| e.dev == dev && e.block == block)?;
        let slot = entry.slot;
        // Taken while the bucket lock is held, so an eviction scan (which
        // visits this bucket under its lock) can never observe a stale zero.
        self.slots[slot].refcount.fetch_add(1, Ordering::Relaxed);
        Some(slot)
    }

    /// Block until the slot's content lock is free and wrap it in a handle.
    /// Called with no structural lock held.
    fn lock_slot(&self, slot: SlotId, dev: DeviceId, block: BlockNo) -> BlockHandle<'_> {
        BlockHandle {
            guard: self.slots[slot].data.lock(),
            slot,
            dev,
            block,
        }
    }

    /// Find the least-recently-used unreferenced slot across every bucket
    /// and rebind it to `(dev, block)` in bucket `home`.
    ///
    /// Caller must hold the global lock and no bucket lock. Buckets are
    /// visited in a fixed ascending order; the current best candidate's
    /// bucket lock is retained from discovery through migration so no other
    /// evictor can claim the same slot, and every other bucket lock is
    /// released as soon as the bucket is ruled out. At most two bucket
    /// locks are held at any instant.
    fn evict_and_install(&self, dev: DeviceId, block: BlockNo, home: usize) -> SlotId {
        debug_assert!(self.global.is_locked());

        struct Best<'a> {
            bucket: usize,
            pos: usize,
            guard: MutexGuard<'a, Bucket>,
            tick: u64,
        }

        let mut best: Option<Best<'_>> = None;
        for i in 0..self.buckets.len() {
            let guard = self.buckets[i].lock();

            // Best candidate within this bucket. Later ties win, and a
            // never-used slot (tick 0) beats everything.
            let mut local: Option<(usize, u64)> = None;
            for (pos, entry) in guard.entries.iter().enumerate() {
                let slot = &self.slots[entry.slot];
                if slot.refcount.load(Ordering::Relaxed) != 0 {
                    continue;
                }
                let tick = slot.tick.load(Ordering::Relaxed);
                if local.map_or(true, |(_, t)| tick <= t) {
                    local = Some((pos, tick));
                }
                if tick == 0 {
                    break;
                }
            }

            match local {
                Some((pos, tick)) if best.as_ref().map_or(true, |b| tick <= b.tick) => {
                    // Replacing `best` unlocks the previously retained
                    // bucket; only the new best stays locked.
                    best = Some(Best {
                        bucket: i,
                        pos,
                        guard,
                        tick,
                    });
                    if tick == 0 {
                        break;
                    }
                }
                _ => drop(guard),
            }
        }

        let Some(Best {
            bucket: src,
            pos,
            guard: mut src_guard,
            ..
        }) = best
        else {
            panic!("bcache: out of buffer slots");
        };

        let slot = src_guard.entries[pos].slot;
        if src == home {
            src_guard.entries.remove(pos);
            src_guard.entries.insert(0, Entry { slot, dev, block });
            self.rebind(slot);
        } else {
            // Still under the global lock, so nesting a second bucket lock
            // cannot deadlock with another evictor.
            let mut home_guard = self.buckets[home].lock();
            src_guard.entries.remove(pos);
            drop(src_guard);
            home_guard.entries.insert(0, Entry { slot, dev, block });
            self.rebind(slot);
            trace!(
                "bcache: slot {} migrated bucket {} -> {} for dev {} block {}",
                slot,
                src,
                home,
                dev.0,
                block.0
            );
        }
        slot
    }

    /// Stamp a recycled slot for its new identity: contents unknown, one
    /// reference (the caller's), fresh recency. Called with the owning
    /// bucket's lock held.
    fn rebind(&self, slot: SlotId) {
        let s = &self.slots[slot];
        s.valid.store(false, Ordering::Relaxed);
        s.refcount.store(1, Ordering::Relaxed);
        s.tick.store(self.next_tick(), Ordering::Relaxed);
    }
}

/// Exclusive, content-locked handle to one cached block.
///
/// The handle owns the slot's content lock, so reading or writing the
/// payload, or calling [`BlockCache::write`], is only possible while the
/// block is held. Give the handle back with [`BlockCache::release`];
/// dropping it instead releases the lock but leaks the reference, pinning
/// the slot in the cache forever.
pub struct BlockHandle<'a> {
    guard: SleepLockGuard<'a, [u8; BLOCK_SIZE]>,
    slot: SlotId,
    dev: DeviceId,
    block: BlockNo,
}

impl BlockHandle<'_> {
    /// The device this block belongs to.
    pub fn device(&self) -> DeviceId {
        self.dev
    }

    /// The block number this handle mirrors.
    pub fn block(&self) -> BlockNo {
        self.block
    }
}

impl Deref for BlockHandle<'_> {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for BlockHandle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

// Global cache instance

static BCACHE: OnceCell<BlockCache> = OnceCell::uninit();

/// Initialize the global block cache. Called once at boot, after the disk
/// driver is ready. Panics on a second call.
pub fn init(config: CacheConfig, device: Arc<dyn BlockDevice>) {
    BCACHE
        .try_init_once(|| BlockCache::new(config, device))
        .expect("bcache: already initialized");
}

/// The global block cache. Panics if called before [`init`].
pub fn get() -> &'static BlockCache {
    BCACHE.try_get().expect("bcache: not initialized")
}
