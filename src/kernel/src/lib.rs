//! LohkoOS Kernel resource core
//!
//! The kernel's only shared mutable resources: a sharded cache of disk-block
//! contents and a sharded per-core physical page allocator. Every higher
//! subsystem (filesystem, virtual memory, process creation) draws on these
//! two pools through the narrow interfaces exported here.
//!
//! # Architecture
//!
//! The core is structured into the following modules:
//! - `sync`: long-term sleep lock guarding cached block contents
//! - `bcache`: the block buffer cache (`acquire`/`read`/`write`/`release`)
//! - `kalloc`: the per-core physical page allocator (`allocate`/`free`)
//!
//! # Safety
//!
//! This is a `#![no_std]` core (the test build links the standard library so
//! the suite can spawn real threads). All unsafe code is documented with
//! safety invariants explaining why the usage is correct.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod bcache;
pub mod kalloc;
pub mod sync;

use alloc::sync::Arc;
use lohko_hal::BlockDevice;

/// Initializes the global resource pools.
///
/// Called once early in the boot process, after the heap is available and
/// the disk driver is ready. Panics on a second call.
pub fn init(cache: bcache::CacheConfig, mem: kalloc::MemConfig, device: Arc<dyn BlockDevice>) {
    kalloc::init(mem);
    bcache::init(cache, device);
}
