//! System-wide error types for LohkoOS.

use core::fmt;

/// Block device error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceError {
    /// The transfer failed at the hardware level
    Io,
    /// The block number lies outside the device
    OutOfRange,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io => write!(f, "device I/O failed"),
            DeviceError::OutOfRange => write!(f, "block number out of range"),
        }
    }
}

/// Physical page allocator error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocError {
    /// Every core's free list is empty
    OutOfPages,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfPages => write!(f, "no physical pages available"),
        }
    }
}
