//! Synchronization primitives for kernel threads.
//!
//! Short-term structural state (bucket membership, free-list heads) is
//! guarded directly with [`spin::Mutex`]; critical sections under those
//! locks are bounded and never block on I/O. This module adds the one
//! primitive the resource core needs beyond that: the [`SleepLock`], a
//! long-term lock that may be held across a blocking device transfer.
//!
//! # Primitives
//!
//! - [`SleepLock<T>`]: exclusive long-term lock, safe to hold across I/O

mod sleeplock;

pub use sleeplock::{SleepLock, SleepLockGuard};
