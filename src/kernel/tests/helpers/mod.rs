//! Shared fixtures for the resource-core test suite.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use lohko_common::error::DeviceError;
use lohko_common::ids::{BlockNo, DeviceId};
use lohko_hal::BlockDevice;
use lohko_kernel::bcache::{BlockCache, CacheConfig, BLOCK_SIZE};

/// An in-memory block device. Blocks that were never written read as
/// zeros; reads and writes are counted so tests can observe exactly when
/// the cache goes to the device.
pub struct RamDisk {
    blocks: Mutex<BTreeMap<(DeviceId, BlockNo), [u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of successful block reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes accepted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every subsequent transfer fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// The stored contents of one block, if it was ever written.
    pub fn block(&self, dev: DeviceId, block: BlockNo) -> Option<[u8; BLOCK_SIZE]> {
        self.blocks.lock().get(&(dev, block)).copied()
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, dev: DeviceId, block: BlockNo, buf: &mut [u8]) -> Result<(), DeviceError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(DeviceError::Io);
        }
        match self.blocks.lock().get(&(dev, block)) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, dev: DeviceId, block: BlockNo, buf: &[u8]) -> Result<(), DeviceError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(DeviceError::Io);
        }
        let mut data = [0u8; BLOCK_SIZE];
        data.copy_from_slice(buf);
        self.blocks.lock().insert((dev, block), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A cache over a fresh RamDisk, with the disk kept around for inspection.
pub fn cache_with_disk(buckets: usize, slots_per_bucket: usize) -> (BlockCache, Arc<RamDisk>) {
    let disk = Arc::new(RamDisk::new());
    let cache = BlockCache::new(
        CacheConfig {
            buckets,
            slots_per_bucket,
        },
        disk.clone(),
    );
    (cache, disk)
}
