//! Communication-library seam for collective thunks

use crate::dtype::DType;
use crate::memory::DeviceMemory;
use crate::Result;

/// An opened communicator for one rank of a collective group.
///
/// Creating and destroying communicators is the caller's business; thunks
/// only issue operations on one they are handed.
pub trait Communicator {
    type Stream;

    /// This communicator's rank (0-based).
    fn rank(&self) -> usize;

    /// Total number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Start batching subsequent operations into one launch.
    ///
    /// # Errors
    /// Returns an error if the library rejects the call.
    fn group_start(&self) -> Result<()>;

    /// Launch every operation issued since [`Communicator::group_start`].
    ///
    /// # Errors
    /// Returns an error if the library rejects the call.
    fn group_end(&self) -> Result<()>;

    /// Gather `count` elements from every rank's `send` into each rank's
    /// `recv`, concatenated in rank order. Enqueued on `stream`.
    ///
    /// # Errors
    /// Returns an error if the library reports a failure.
    fn all_gather(
        &self,
        send: DeviceMemory,
        recv: DeviceMemory,
        dtype: DType,
        count: usize,
        stream: &Self::Stream,
    ) -> Result<()>;
}
