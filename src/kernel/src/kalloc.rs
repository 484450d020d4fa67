//! Per-core physical page allocator.
//!
//! Allocates whole pages for process images, kernel stacks, and page-table
//! construction. The usable physical range is carved into one free list per
//! execution core at boot; allocation pops from the calling core's own list
//! under that list's lock, and only reaches across to another core — an
//! explicit, lock-guarded ownership transfer of one page — when the local
//! list runs dry. Frees always go back to the caller's own list, keeping
//! pages hot for the next local allocation.
//!
//! Free pages carry their own bookkeeping: the leading bytes of each free
//! page hold the index of the next free page, so the allocator needs no
//! side table.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use core::slice;

use conquer_once::spin::OnceCell;
use log::{debug, info};
use spin::Mutex;

use lohko_common::error::AllocError;
use lohko_common::ids::CoreId;

/// Size in bytes of one physical page.
pub const PAGE_SIZE: usize = 4096;

/// Fill byte stored into a page when it is freed, to make use-after-free
/// bugs observable. A debug aid, not a security measure.
const FREE_FILL: u8 = 1;

/// Fill byte stored into a page when it is handed out, to make
/// uninitialized reads observable.
const ALLOC_FILL: u8 = 5;

/// Marker for the end of a free list.
const NO_PAGE: usize = usize::MAX;

/// Startup-time shape of the physical pool.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    /// Number of execution cores, one free list each.
    pub cores: usize,
    /// Total number of pages in the pool.
    pub pages: usize,
}

/// Head of one core's free list. The links live inside the free pages
/// themselves; only the head and a count are kept here.
struct FreeList {
    head: usize,
    len: usize,
}

/// The page-aligned backing store all pages are carved from.
///
/// Created once at boot and never resized. Free pages are only touched by
/// the thread holding the owning core's list lock; allocated pages are only
/// touched through their [`PageHandle`], which is an exclusive owner.
struct Arena {
    base: NonNull<u8>,
    pages: usize,
}

// Safety: The arena itself is just a region pointer; all access to the
// memory behind it is serialized by the per-core list locks (free pages) or
// by exclusive handle ownership (allocated pages).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(pages: usize) -> Self {
        let layout = Self::layout(pages);
        // SAFETY: `layout` has nonzero size; `pages` is validated nonzero
        // by the caller.
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).expect("kalloc: arena allocation failed");
        Self { base, pages }
    }

    fn layout(pages: usize) -> Layout {
        let size = pages
            .checked_mul(PAGE_SIZE)
            .expect("kalloc: arena size overflows");
        Layout::from_size_align(size, PAGE_SIZE).expect("kalloc: bad arena layout")
    }

    /// Pointer to the first byte of page `index`.
    fn page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.pages);
        // SAFETY: `index` is in bounds, so the offset stays inside the one
        // allocation `base` points to.
        unsafe { self.base.as_ptr().add(index * PAGE_SIZE) }
    }

    /// Read the next-free link from the leading bytes of free page `index`.
    ///
    /// # Safety
    ///
    /// Caller must hold the lock of the list the page is on.
    unsafe fn read_link(&self, index: usize) -> usize {
        // Pages are PAGE_SIZE-aligned, so the leading bytes are aligned
        // for a usize.
        ptr::read(self.page_ptr(index) as *const usize)
    }

    /// Store the next-free link into the leading bytes of free page `index`.
    ///
    /// # Safety
    ///
    /// Caller must hold the lock of the list the page is being pushed onto,
    /// and no handle to the page may exist.
    unsafe fn write_link(&self, index: usize, next: usize) {
        ptr::write(self.page_ptr(index) as *mut usize, next)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `base` came from `alloc` with this exact layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.pages)) }
    }
}

/// The sharded physical page pool.
pub struct PageAllocator {
    arena: Arena,
    cores: Box<[Mutex<FreeList>]>,
}

impl PageAllocator {
    /// Build the pool and distribute its pages round-robin across the
    /// per-core lists, so every core starts with a roughly equal share.
    ///
    /// Panics if either count is zero or the arena size overflows.
    pub fn new(config: MemConfig) -> Self {
        assert!(config.cores > 0, "kalloc: core count must be nonzero");
        assert!(config.pages > 0, "kalloc: page count must be nonzero");

        let arena = Arena::new(config.pages);
        let cores: Box<[Mutex<FreeList>]> = (0..config.cores)
            .map(|_| {
                Mutex::new(FreeList {
                    head: NO_PAGE,
                    len: 0,
                })
            })
            .collect();
        let pool = Self { arena, cores };

        for index in 0..config.pages {
            pool.push(index % config.cores, index);
        }

        info!(
            "kalloc: {} pages across {} cores",
            config.pages, config.cores
        );
        pool
    }

    /// Number of cores the pool is sharded across.
    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Total free pages across every core. Diagnostic only; the value can
    /// be stale by the time the caller looks at it.
    pub fn free_pages(&self) -> usize {
        self.cores.iter().map(|list| list.lock().len).sum()
    }

    /// Free pages currently on `core`'s own list.
    pub fn free_pages_on(&self, core: CoreId) -> usize {
        self.cores[core.index()].lock().len
    }

    /// Allocate one page, preferring `core`'s own list.
    ///
    /// On local exhaustion every other core's list is tried in fixed
    /// ascending order; a page taken that way is stolen outright and
    /// belongs to the caller's core from then on. Errs only when every
    /// list is empty.
    pub fn allocate(&self, core: CoreId) -> Result<PageHandle<'_>, AllocError> {
        let me = core.index();
        assert!(me < self.cores.len(), "kalloc: core {} out of range", me);

        if let Some(index) = self.pop(me) {
            return Ok(self.take(index));
        }
        for donor in 0..self.cores.len() {
            if donor == me {
                continue;
            }
            if let Some(index) = self.pop(donor) {
                debug!("kalloc: core {} stole page {} from core {}", me, index, donor);
                return Ok(self.take(index));
            }
        }
        Err(AllocError::OutOfPages)
    }

    /// Return a page to `core`'s own list.
    ///
    /// Frees are always local: the caller names its own core, never the
    /// one the page was first carved out for. Panics if the handle was
    /// issued by a different pool; accepting it would mark one of this
    /// pool's pages free while a live handle to it still exists.
    pub fn free(&self, core: CoreId, page: PageHandle<'_>) {
        let me = core.index();
        assert!(me < self.cores.len(), "kalloc: core {} out of range", me);
        assert!(ptr::eq(page.pool, self), "kalloc: foreign page handle");
        let PageHandle { index, .. } = page;
        self.push(me, index);
    }

    /// Pop the head of `core`'s list, if any.
    fn pop(&self, core: usize) -> Option<usize> {
        let mut list = self.cores[core].lock();
        if list.head == NO_PAGE {
            return None;
        }
        let index = list.head;
        // SAFETY: `index` heads this list and we hold the list's lock.
        list.head = unsafe { self.arena.read_link(index) };
        list.len -= 1;
        Some(index)
    }

    /// Fill a just-popped page with the allocation pattern and wrap it.
    fn take(&self, index: usize) -> PageHandle<'_> {
        // SAFETY: the page was popped off a free list, so no link points at
        // it and no handle exists; this thread is its sole owner.
        unsafe { ptr::write_bytes(self.arena.page_ptr(index), ALLOC_FILL, PAGE_SIZE) };
        PageHandle { pool: self, index }
    }

    /// Fill a page with the free pattern and push it onto `core`'s list.
    fn push(&self, core: usize, index: usize) {
        // SAFETY: the caller's handle was consumed (or, at boot, no handle
        // was ever made), so this thread is the page's sole owner.
        unsafe { ptr::write_bytes(self.arena.page_ptr(index), FREE_FILL, PAGE_SIZE) };
        let mut list = self.cores[core].lock();
        // SAFETY: the page is not yet linked and we hold this list's lock.
        unsafe { self.arena.write_link(index, list.head) };
        list.head = index;
        list.len += 1;
    }
}

/// Exclusively owned handle to one page-aligned, page-sized byte range.
///
/// Obtained from [`PageAllocator::allocate`] and consumed by
/// [`PageAllocator::free`], so a page cannot be freed twice or used after
/// free through safe code. Dropping a handle without freeing it leaks the
/// page until reboot.
pub struct PageHandle<'a> {
    pool: &'a PageAllocator,
    index: usize,
}

impl PageHandle<'_> {
    /// Index of this page within the pool. Stable for the life of the
    /// handle; a freed page may be handed out again under the same index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The page's contents.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the handle exclusively owns this page from allocate to
        // free; the allocator never touches a non-free page.
        unsafe { slice::from_raw_parts(self.pool.arena.page_ptr(self.index), PAGE_SIZE) }
    }

    /// The page's contents, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `bytes`, plus `&mut self` rules out a second slice.
        unsafe { slice::from_raw_parts_mut(self.pool.arena.page_ptr(self.index), PAGE_SIZE) }
    }
}

// Global allocator instance

static KALLOC: OnceCell<PageAllocator> = OnceCell::uninit();

/// Initialize the global page allocator. Called once at boot, before any
/// page is handed out. Panics on a second call.
pub fn init(config: MemConfig) {
    KALLOC
        .try_init_once(|| PageAllocator::new(config))
        .expect("kalloc: already initialized");
}

/// The global page allocator. Panics if called before [`init`].
pub fn get() -> &'static PageAllocator {
    KALLOC.try_get().expect("kalloc: not initialized")
}
