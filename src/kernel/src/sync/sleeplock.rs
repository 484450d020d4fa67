//! Long-term exclusive lock for data held across device I/O.
//!
//! A spin lock must never be held across a blocking disk transfer, so the
//! buffer cache guards each slot's contents with this lock instead: the
//! lock state itself is protected by a short-held spin lock, and a
//! contending thread backs off between attempts rather than occupying the
//! state lock while it waits. Scheduler-assisted wakeup lives outside this
//! core; waiters here relax the CPU until the holder releases.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use spin::Mutex;

/// An exclusive lock that may be held across blocking device I/O.
///
/// Unlike a bare spin lock, the internal spin-guarded critical section only
/// covers the lock *state*, never the protected data, so a thread waiting
/// for a slow holder does not monopolize any spin lock.
///
/// # Example
///
/// ```ignore
/// let contents = SleepLock::new([0u8; 512]);
///
/// let mut guard = contents.lock();
/// guard[0] = 1;
/// // guard is dropped here, releasing the lock
/// ```
pub struct SleepLock<T> {
    /// Lock state: false = unlocked, true = locked. The spin mutex guards
    /// the state transitions only.
    locked: Mutex<bool>,
    /// The protected data.
    data: UnsafeCell<T>,
}

// Safety: The lock provides exclusive access to T. Sharing the lock across
// threads is safe because every access to `data` goes through a guard, and
// at most one guard exists at a time.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Create a new unlocked sleep lock protecting the given data.
    pub const fn new(data: T) -> Self {
        Self {
            locked: Mutex::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Attempt to acquire the lock without waiting.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it's held
    /// by another thread.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut locked = self.locked.lock();
        if *locked {
            None
        } else {
            *locked = true;
            Some(SleepLockGuard { lock: self })
        }
    }

    /// Acquire the lock, waiting for the current holder if necessary.
    ///
    /// The holder may be in the middle of a disk transfer, so the wait can
    /// be long; the calling thread relaxes the CPU between attempts.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            hint::spin_loop();
        }
    }

    /// Whether the lock is currently held by some thread.
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

/// RAII guard that releases the sleep lock when dropped.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        *self.lock.locked.lock() = false;
    }
}
