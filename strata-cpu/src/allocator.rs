//! Scratch allocation from a host arena

use strata::{DeviceMemory, Error, Result, ScratchAllocator};

use crate::device::HostDevice;

/// Hands out workspace from a [`HostDevice`], optionally capped.
pub struct ArenaScratchAllocator {
    device: HostDevice,
    limit: Option<usize>,
    allocated: usize,
}

impl ArenaScratchAllocator {
    #[must_use]
    pub fn new(device: HostDevice) -> Self {
        Self {
            device,
            limit: None,
            allocated: 0,
        }
    }

    /// Fail any request that would take the total past `limit` bytes.
    #[must_use]
    pub fn with_limit(device: HostDevice, limit: usize) -> Self {
        Self {
            device,
            limit: Some(limit),
            allocated: 0,
        }
    }

    /// Total bytes handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl ScratchAllocator for ArenaScratchAllocator {
    fn allocate_bytes(&mut self, bytes: usize) -> Result<DeviceMemory> {
        let total = self.allocated + bytes;
        if let Some(limit) = self.limit {
            if total > limit {
                return Err(Error::ScratchAllocation {
                    bytes,
                    reason: format!(
                        "{} of {limit} scratch bytes already in use",
                        self.allocated
                    ),
                });
            }
        }
        self.allocated = total;
        Ok(self.device.alloc(bytes))
    }
}
