//! Host memory standing in for device memory
//!
//! A [`HostDevice`] is a bump arena of zeroed bytes. Handles it hands out are
//! plain [`DeviceMemory`] values whose addresses are arena offsets shifted by
//! [`ARENA_BASE`], so the null address is never valid. Clones share the same
//! arena.

use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::Pod;
use strata::{DeviceMemory, Error, Result};

/// Address of the first byte in every arena.
pub const ARENA_BASE: u64 = 0x1000;

/// Alignment of every allocation, in bytes.
pub const ALLOC_ALIGN: usize = 64;

#[derive(Clone)]
pub struct HostDevice {
    ordinal: usize,
    arena: Arc<Mutex<Vec<u8>>>,
}

impl HostDevice {
    #[must_use]
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            arena: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.lock().len()
    }

    /// Allocate `bytes` zeroed bytes.
    #[must_use]
    pub fn alloc(&self, bytes: usize) -> DeviceMemory {
        let mut arena = self.lock();
        let start = arena.len().next_multiple_of(ALLOC_ALIGN);
        arena.resize(start + bytes, 0);
        DeviceMemory::new(ARENA_BASE + start as u64, bytes)
    }

    /// Allocate and fill a buffer from host data.
    #[must_use]
    pub fn alloc_from<T: Pod>(&self, data: &[T]) -> DeviceMemory {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mem = self.alloc(bytes.len());
        self.lock()[offset(mem)..offset(mem) + bytes.len()].copy_from_slice(bytes);
        mem
    }

    /// Copy the whole region out of the arena.
    ///
    /// # Errors
    /// Returns an error if the region is not inside this arena.
    pub fn read_bytes(&self, mem: DeviceMemory) -> Result<Vec<u8>> {
        let arena = self.lock();
        let range = checked_range(&arena, mem)?;
        Ok(arena[range].to_vec())
    }

    /// Overwrite the start of the region with `data`.
    ///
    /// # Errors
    /// Returns an error if `data` is larger than the region or the region is
    /// not inside this arena.
    pub fn write_bytes(&self, mem: DeviceMemory, data: &[u8]) -> Result<()> {
        let target = mem.slice(0, data.len())?;
        let mut arena = self.lock();
        let range = checked_range(&arena, target)?;
        arena[range].copy_from_slice(data);
        Ok(())
    }

    /// Read the region as a vector of `T`.
    ///
    /// # Errors
    /// Returns an error if the region is not inside this arena or its size
    /// is not a multiple of `size_of::<T>()`.
    pub fn read<T: Pod>(&self, mem: DeviceMemory) -> Result<Vec<T>> {
        let bytes = self.read_bytes(mem)?;
        if bytes.len() % std::mem::size_of::<T>() != 0 {
            return Err(Error::Backend(format!(
                "{} byte region is not a whole number of {}-byte elements",
                bytes.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Write `data` to the start of the region.
    ///
    /// # Errors
    /// Returns an error if `data` does not fit.
    pub fn write<T: Pod>(&self, mem: DeviceMemory, data: &[T]) -> Result<()> {
        self.write_bytes(mem, bytemuck::cast_slice(data))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.arena.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn offset(mem: DeviceMemory) -> usize {
    (mem.addr() - ARENA_BASE) as usize
}

fn checked_range(arena: &[u8], mem: DeviceMemory) -> Result<std::ops::Range<usize>> {
    if mem.addr() < ARENA_BASE {
        return Err(Error::Backend(format!(
            "address {:#x} is not a host device address",
            mem.addr()
        )));
    }
    let start = offset(mem);
    let end = start + mem.size();
    if end > arena.len() {
        return Err(Error::Backend(format!(
            "region [{:#x}, +{}) is outside the {} byte arena",
            mem.addr(),
            mem.size(),
            arena.len()
        )));
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned_and_zeroed() {
        let device = HostDevice::new(0);
        let a = device.alloc(3);
        let b = device.alloc(8);
        assert_eq!(a.addr(), ARENA_BASE);
        assert_eq!((b.addr() - ARENA_BASE) as usize % ALLOC_ALIGN, 0);
        assert_eq!(device.read_bytes(b).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_typed_roundtrip() {
        let device = HostDevice::new(0);
        let mem = device.alloc_from(&[1.0f32, -2.5, 3.25]);
        assert_eq!(mem.size(), 12);
        assert_eq!(device.read::<f32>(mem).unwrap(), vec![1.0, -2.5, 3.25]);

        device.write(mem.slice(4, 8).unwrap(), &[7.0f32, 8.0]).unwrap();
        assert_eq!(device.read::<f32>(mem).unwrap(), vec![1.0, 7.0, 8.0]);
    }

    #[test]
    fn test_half_types() {
        let device = HostDevice::new(0);
        let data = [half::bf16::from_f32(1.5), half::bf16::from_f32(-4.0)];
        let mem = device.alloc_from(&data);
        assert_eq!(device.read::<half::bf16>(mem).unwrap(), data.to_vec());
    }

    #[test]
    fn test_out_of_arena_access_fails() {
        let device = HostDevice::new(0);
        let mem = device.alloc(16);
        assert!(device.read_bytes(DeviceMemory::new(mem.addr(), 32)).is_err());
        assert!(device.read_bytes(DeviceMemory::new(8, 4)).is_err());
        assert!(device.write_bytes(mem, &[0u8; 17]).is_err());
        assert!(device.read::<f32>(mem.slice(0, 6).unwrap()).is_err());
    }

    #[test]
    fn test_clones_share_arena() {
        let device = HostDevice::new(1);
        let other = device.clone();
        let mem = device.alloc_from(&[5u32]);
        assert_eq!(other.read::<u32>(mem).unwrap(), vec![5]);
        assert_eq!(other.ordinal(), 1);
    }
}
