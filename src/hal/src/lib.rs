//! LohkoOS Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines traits that abstract away platform-specific hardware details.

#![no_std]

use lohko_common::error::DeviceError;
use lohko_common::ids::{BlockNo, DeviceId};

/// Trait for a synchronous block-storage device.
///
/// One implementor may serve several device ids (e.g. multiple virtio disks
/// behind one driver). Transfers block the calling thread until the device
/// reports completion.
pub trait BlockDevice: Send + Sync {
    /// Reads one block into `buf`.
    ///
    /// `buf` is exactly one block long; the device fills it completely on
    /// success and leaves it unspecified on failure.
    fn read_block(&self, dev: DeviceId, block: BlockNo, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes one block from `buf`.
    ///
    /// `buf` is exactly one block long.
    fn write_block(&self, dev: DeviceId, block: BlockNo, buf: &[u8]) -> Result<(), DeviceError>;
}
