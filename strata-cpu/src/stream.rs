//! In-order execution stream
//!
//! Work is queued by the thunks and only runs when the owner calls
//! [`CpuStream::synchronize`], which mirrors how a device stream decouples
//! submission from completion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use strata::Result;

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// A FIFO queue of pending work.
pub struct CpuStream {
    id: u64,
    queue: Mutex<VecDeque<Work>>,
}

impl CpuStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Process-unique id, used to key per-stream engine state.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append work to the end of the queue.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.lock().push_back(Box::new(work));
    }

    /// Number of queued, not yet executed, work items.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Run queued work in submission order until the queue is empty.
    ///
    /// # Errors
    /// Returns the first error raised by a work item. Work queued after the
    /// failing item is discarded.
    pub fn synchronize(&self) -> Result<()> {
        loop {
            // Pop under the lock, run without it: work may enqueue more work.
            let Some(work) = self.lock().pop_front() else {
                return Ok(());
            };
            if let Err(e) = work() {
                let dropped = {
                    let mut queue = self.lock();
                    let n = queue.len();
                    queue.clear();
                    n
                };
                tracing::warn!(stream = self.id, dropped, "stream work failed: {e}");
                return Err(e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Work>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for CpuStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata::Error;

    #[test]
    fn test_streams_get_distinct_ids() {
        assert_ne!(CpuStream::new().id(), CpuStream::new().id());
    }

    #[test]
    fn test_work_runs_in_fifo_order_on_synchronize() {
        let stream = CpuStream::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            stream.enqueue(move || {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert_eq!(stream.pending(), 3);
        assert!(log.lock().unwrap().is_empty());

        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_failure_discards_remaining_work() {
        let stream = CpuStream::new();
        let ran = Arc::new(Mutex::new(false));
        stream.enqueue(|| Err(Error::Backend("boom".to_string())));
        let flag = Arc::clone(&ran);
        stream.enqueue(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        assert!(matches!(stream.synchronize(), Err(Error::Backend(_))));
        assert!(!*ran.lock().unwrap());
        assert_eq!(stream.pending(), 0);
    }
}
