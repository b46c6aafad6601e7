//! Opaque slab handles.

use std::fmt;

use super::Device;

/// Raw device address of a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Contiguous slab of device-resident storage.
///
/// Neither `Clone` nor `Copy`: handing a `Memory` to
/// [`SlabPool::release`](crate::pool::SlabPool::release) gives it up.
/// Dropping a handle does not free device memory; whoever allocated the
/// slab through the driver is responsible for that.
#[derive(Debug, PartialEq, Eq)]
pub struct Memory {
    device: Device,
    ptr: DevicePtr,
    size: usize,
}

impl Memory {
    /// Wrap a slab allocated by the caller's driver.
    pub fn new(device: Device, ptr: DevicePtr, size: usize) -> Self {
        Self { device, ptr, size }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size tag in bytes (the size class the slab was allocated for)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Identity of the underlying slab
    pub fn slab_id(&self) -> (Device, DevicePtr) {
        (self.device, self.ptr)
    }

    /// Give the raw parts back to the driver for deallocation.
    pub fn into_parts(self) -> (Device, DevicePtr, usize) {
        (self.device, self.ptr, self.size)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({} bytes)", self.device, self.ptr, self.size)
    }
}
