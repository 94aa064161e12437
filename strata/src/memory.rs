//! Device memory handles and the scratch allocator seam
//!
//! The thunks never own device memory. They receive opaque
//! [`DeviceMemory`] handles from the executor, resolve buffer slices
//! against [`BufferAllocations`], and request workspace through a
//! [`ScratchAllocator`] supplied by the caller.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque handle to a region of device memory.
///
/// `addr` is whatever the backend uses to identify memory (a device
/// pointer for GPUs, an arena offset for the CPU reference backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMemory {
    addr: u64,
    size: usize,
}

impl DeviceMemory {
    #[must_use]
    pub const fn new(addr: u64, size: usize) -> Self {
        Self { addr, size }
    }

    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// Size of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Sub-region `[offset, offset + size)` of this handle.
    ///
    /// # Errors
    /// Returns an error if the sub-region does not fit.
    pub fn slice(&self, offset: usize, size: usize) -> Result<Self> {
        let end = offset.checked_add(size).ok_or_else(|| {
            Error::InvalidConfig(format!("slice offset {offset} + size {size} overflows"))
        })?;
        if end > self.size {
            return Err(Error::InvalidConfig(format!(
                "slice [{offset}, {end}) out of bounds for {} byte region",
                self.size
            )));
        }
        Ok(Self {
            addr: self.addr + offset as u64,
            size,
        })
    }
}

/// Workspace allocator provided by the executor.
///
/// Allocations live until the allocator itself is dropped; the thunks never
/// free scratch memory.
pub trait ScratchAllocator {
    /// Allocate `bytes` bytes of scratch memory.
    ///
    /// # Errors
    /// Returns an error if the allocation cannot be satisfied.
    fn allocate_bytes(&mut self, bytes: usize) -> Result<DeviceMemory>;
}

/// A byte range inside one of the executable's buffer allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSlice {
    /// Index into [`BufferAllocations`]
    pub allocation: usize,
    pub offset: usize,
    pub size: usize,
}

/// Base addresses of all buffer allocations for one execution.
#[derive(Debug, Clone, Default)]
pub struct BufferAllocations {
    buffers: Vec<DeviceMemory>,
}

impl BufferAllocations {
    #[must_use]
    pub fn new(buffers: Vec<DeviceMemory>) -> Self {
        Self { buffers }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Resolve a slice to the device memory it covers.
    ///
    /// # Errors
    /// Returns an error if the allocation index is unknown or the slice
    /// extends past the end of its allocation.
    pub fn device_address(&self, slice: BufferSlice) -> Result<DeviceMemory> {
        let base = self.buffers.get(slice.allocation).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "buffer allocation {} not found ({} allocations)",
                slice.allocation,
                self.buffers.len()
            ))
        })?;
        base.slice(slice.offset, slice.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_offsets_address() {
        let mem = DeviceMemory::new(0x1000, 256);
        let sub = mem.slice(64, 32).unwrap();
        assert_eq!(sub.addr(), 0x1040);
        assert_eq!(sub.size(), 32);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let mem = DeviceMemory::new(0x1000, 256);
        assert!(mem.slice(250, 8).is_err());
        assert!(mem.slice(usize::MAX, 2).is_err());
        assert!(mem.slice(256, 0).is_ok());
    }

    #[test]
    fn test_buffer_allocations_resolve() {
        let allocs = BufferAllocations::new(vec![
            DeviceMemory::new(0x100, 64),
            DeviceMemory::new(0x800, 128),
        ]);
        let mem = allocs
            .device_address(BufferSlice {
                allocation: 1,
                offset: 16,
                size: 64,
            })
            .unwrap();
        assert_eq!(mem, DeviceMemory::new(0x810, 64));

        let missing = allocs.device_address(BufferSlice {
            allocation: 2,
            offset: 0,
            size: 4,
        });
        assert!(matches!(missing, Err(Error::InvalidConfig(_))));
    }
}
