use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Ordered collection of piece indices still waiting to be downloaded.
///
/// Sessions reserve a piece by taking it out; a reservation is exclusive
/// until the piece verifies or the index is handed back. Failed pieces
/// (hash mismatch, session death mid-download) come back at the front so
/// they are retried before untouched ones.
#[derive(Debug)]
pub struct WorkQueue {
    pieces: Mutex<VecDeque<u32>>,
}

#[derive(Debug, PartialEq)]
pub enum WorkQueueError {
    PoisonedQueueLock,
}

impl WorkQueue {
    /// A queue holding every piece index in `0..total_pieces`, in order.
    pub fn new(total_pieces: u32) -> Self {
        Self {
            pieces: Mutex::new((0..total_pieces).collect()),
        }
    }

    /// Removes and returns the first index for which `wanted` holds,
    /// scanning from the head. Used with the remote bitfield to reserve a
    /// piece this particular peer can actually provide.
    pub fn take_one<F>(&self, wanted: F) -> Result<Option<u32>, WorkQueueError>
    where
        F: Fn(u32) -> bool,
    {
        let mut pieces = self.lock()?;
        match pieces.iter().position(|index| wanted(*index)) {
            Some(at) => Ok(pieces.remove(at)),
            None => Ok(None),
        }
    }

    /// Reinserts an index at the front of the queue.
    pub fn return_head(&self, index: u32) -> Result<(), WorkQueueError> {
        self.lock()?.push_front(index);
        Ok(())
    }

    /// Whether any queued index satisfies `wanted`; drives the
    /// interested/not-interested signalling.
    pub fn contains<F>(&self, wanted: F) -> Result<bool, WorkQueueError>
    where
        F: Fn(u32) -> bool,
    {
        Ok(self.lock()?.iter().any(|index| wanted(*index)))
    }

    pub fn len(&self) -> Result<usize, WorkQueueError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, WorkQueueError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<VecDeque<u32>>, WorkQueueError> {
        self.pieces
            .lock()
            .map_err(|_| WorkQueueError::PoisonedQueueLock)
    }
}
