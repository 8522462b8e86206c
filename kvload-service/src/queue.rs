//! Bounded queue of send permits between the generator and the workers.

use async_channel::{Receiver, Sender, TrySendError};

use crate::error::{Error, Result};

/// A zero-payload token granting a worker one send slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Permit;

/// Outcome of [`PermitQueue::try_push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Push {
    /// The permit was enqueued.
    Enqueued,
    /// The queue was full and the permit was discarded.
    Full,
    /// All consumers are gone.
    Closed,
}

/// Returns the queue capacity for the given rate and worker count.
///
/// The queue holds one second of backlog at full throughput for every worker.
pub fn queue_capacity(rate: u32, workers: usize) -> Result<usize> {
    if rate == 0 {
        return Err(Error::InvalidConfig("rate must be at least 1".into()));
    }
    if workers == 0 {
        return Err(Error::InvalidConfig("at least one worker is required".into()));
    }

    (rate as usize)
        .checked_mul(workers)
        .ok_or_else(|| Error::InvalidConfig("rate times workers overflows".into()))
}

/// A fixed-capacity multi-consumer queue of [`Permit`]s.
///
/// Pushing never blocks. Popping waits until a permit is available.
#[derive(Clone, Debug)]
pub struct PermitQueue {
    sender: Sender<Permit>,
    receiver: Receiver<Permit>,
}

impl PermitQueue {
    /// Creates a queue that holds at most `capacity` permits.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be positive".into()));
        }

        let (sender, receiver) = async_channel::bounded(capacity);
        Ok(Self { sender, receiver })
    }

    /// Attempts to enqueue one permit without waiting.
    pub fn try_push(&self) -> Push {
        match self.sender.try_send(Permit) {
            Ok(()) => Push::Enqueued,
            Err(TrySendError::Full(_)) => Push::Full,
            Err(TrySendError::Closed(_)) => Push::Closed,
        }
    }

    /// Waits for the next permit.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Permit> {
        self.receiver.recv().await.ok()
    }

    /// Returns the number of permits currently waiting.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    /// Returns `true` if no permits are waiting.
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    /// Returns the maximum number of waiting permits.
    pub fn capacity(&self) -> usize {
        // Bounded channels always report a capacity.
        self.sender.capacity().unwrap_or_default()
    }

    /// Closes the queue. Waiting and future pops return `None` once drained.
    pub fn close(&self) {
        self.sender.close();
    }
}
