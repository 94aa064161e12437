//! In-process communicator
//!
//! Every rank of a [`LoopbackCommunicator`] group lives in the same process
//! and owns its own [`HostDevice`]. Collectives are enqueued on the rank's
//! [`CpuStream`] and rendezvous when the streams are synchronized, so each
//! rank must synchronize on its own thread, just as every NCCL rank has to
//! launch its half of a collective before any of them can finish.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use strata::{Communicator, DType, DeviceMemory, Error, Result};

use crate::device::HostDevice;
use crate::stream::CpuStream;

struct Rendezvous {
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    barrier: Barrier,
}

pub struct LoopbackCommunicator {
    rank: usize,
    world_size: usize,
    device: HostDevice,
    rendezvous: Arc<Rendezvous>,
    group_depth: AtomicUsize,
}

impl LoopbackCommunicator {
    /// Open one communicator per device. Rank `i` is bound to `devices[i]`.
    #[must_use]
    pub fn group(devices: Vec<HostDevice>) -> Vec<Self> {
        let world_size = devices.len();
        let rendezvous = Arc::new(Rendezvous {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        devices
            .into_iter()
            .enumerate()
            .map(|(rank, device)| Self {
                rank,
                world_size,
                device,
                rendezvous: Arc::clone(&rendezvous),
                group_depth: AtomicUsize::new(0),
            })
            .collect()
    }

    #[must_use]
    pub fn device(&self) -> &HostDevice {
        &self.device
    }

    /// Nesting depth of open `group_start` calls.
    #[must_use]
    pub fn group_depth(&self) -> usize {
        self.group_depth.load(Ordering::Acquire)
    }
}

impl Rendezvous {
    /// Publish this rank's contribution and collect everyone's, in rank
    /// order. Every rank sees `None` if any rank failed to contribute.
    fn exchange(&self, rank: usize, contribution: Option<Vec<u8>>) -> Option<Vec<u8>> {
        self.lock()[rank] = contribution;
        self.barrier.wait();
        let gathered = self
            .lock()
            .iter()
            .cloned()
            .collect::<Option<Vec<Vec<u8>>>>()
            .map(|parts| parts.concat());
        // Nobody may overwrite a slot until every rank has read them all.
        self.barrier.wait();
        gathered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<Vec<u8>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Communicator for LoopbackCommunicator {
    type Stream = CpuStream;

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn group_start(&self) -> Result<()> {
        self.group_depth.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        self.group_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                depth.checked_sub(1)
            })
            .map(|_| ())
            .map_err(|_| {
                Error::Collective(format!("rank {}: group_end without group_start", self.rank))
            })
    }

    fn all_gather(
        &self,
        send: DeviceMemory,
        recv: DeviceMemory,
        dtype: DType,
        count: usize,
        stream: &CpuStream,
    ) -> Result<()> {
        let (bytes, gathered_bytes) = count
            .checked_mul(dtype.size_in_bytes())
            .and_then(|bytes| Some((bytes, bytes.checked_mul(self.world_size)?)))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "rank {}: all-gather of {count} x {dtype} overflows",
                    self.rank
                ))
            })?;
        let send = send.slice(0, bytes)?;
        let recv = recv.slice(0, gathered_bytes)?;

        let rank = self.rank;
        let device = self.device.clone();
        let rendezvous = Arc::clone(&self.rendezvous);
        stream.enqueue(move || {
            let local = device.read_bytes(send);
            let gathered = rendezvous.exchange(rank, local.as_ref().ok().cloned());
            local?;
            match gathered {
                Some(data) => device.write_bytes(recv, &data),
                None => Err(Error::Collective(format!(
                    "rank {rank}: all-gather aborted, a peer failed to contribute"
                ))),
            }
        });
        tracing::trace!(rank, %dtype, count, "enqueued all-gather");
        Ok(())
    }
}
