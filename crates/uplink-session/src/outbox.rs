//! Bounded priority outbox
//!
//! One bounded FIFO per [`MessagePriority`]. Producers choose between
//! backpressure ([`BoundedPriorityOutbox::submit_or_block`]) and explicit
//! rejection ([`BoundedPriorityOutbox::submit_or_fail`]); the single consumer
//! calls [`BoundedPriorityOutbox::take_next`], which serves the highest
//! non-empty level first and never blocks.
//!
//! Free slots of each level are tracked by a semaphore. Blocking producers of
//! one level are serialized by a per-level producer lock so that the
//! try-then-wait sequence and its diagnostics stay consistent. The consumer
//! never touches the producer lock; it only pops an item and returns one
//! permit, which is exactly what a waiting producer needs.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::error::OutboxError;
use crate::message::{MessageBlockWithMetadata, MessagePriority};

/// The queue of one priority level
#[derive(Debug)]
struct LevelQueue {
    priority: MessagePriority,
    capacity: usize,
    items: Mutex<VecDeque<MessageBlockWithMetadata>>,
    free_slots: Semaphore,
    producer_lock: tokio::sync::Mutex<()>,
}

impl LevelQueue {
    fn new(priority: MessagePriority, capacity: usize) -> Self {
        Self {
            priority,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            free_slots: Semaphore::new(capacity),
            producer_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Claim a free slot without waiting
    fn try_reserve(&self) -> Result<bool, OutboxError> {
        match self.free_slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(OutboxError::Closed),
        }
    }

    fn push(&self, item: MessageBlockWithMetadata) {
        self.items.lock().push_back(item);
    }

    fn pop(&self) -> Option<MessageBlockWithMetadata> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.free_slots.add_permits(1);
        }
        item
    }

    /// Queue depth and age of the head element
    fn diagnostics(&self) -> (usize, Option<Duration>) {
        let items = self.items.lock();
        (items.len(), items.front().map(|head| head.age()))
    }

    fn capacity_exceeded(&self) -> OutboxError {
        let (depth, head_age) = self.diagnostics();
        OutboxError::CapacityExceeded {
            priority: self.priority,
            depth,
            head_age,
        }
    }
}

/// Per-priority bounded FIFOs with strict priority dequeueing
#[derive(Debug)]
pub struct BoundedPriorityOutbox {
    log_descriptor: String,
    /// Indexed by [`MessagePriority::index`]
    levels: Vec<LevelQueue>,
}

impl BoundedPriorityOutbox {
    /// Create an outbox; every priority level needs a capacity greater than zero
    pub fn new(
        log_descriptor: impl Into<String>,
        capacities: &BTreeMap<MessagePriority, usize>,
    ) -> Result<Self, OutboxError> {
        let levels = MessagePriority::ALL
            .iter()
            .map(|&priority| match capacities.get(&priority) {
                None => Err(OutboxError::MissingCapacity(priority)),
                Some(0) => Err(OutboxError::ZeroCapacity(priority)),
                Some(&capacity) => Ok(LevelQueue::new(priority, capacity)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            log_descriptor: log_descriptor.into(),
            levels,
        })
    }

    fn level(&self, priority: MessagePriority) -> &LevelQueue {
        &self.levels[priority.index()]
    }

    /// Enqueue an item, waiting for space in its priority level if necessary
    ///
    /// Only producers of the same level wait for each other. Dropping the
    /// returned future abandons the item without other side effects. Fails
    /// with [`OutboxError::Closed`] once the outbox is closed, including for
    /// producers that are already waiting.
    pub async fn submit_or_block(&self, item: MessageBlockWithMetadata) -> Result<(), OutboxError> {
        let level = self.level(item.priority);
        let _producer = level.producer_lock.lock().await;

        if level.try_reserve()? {
            level.push(item);
            return Ok(());
        }

        let (depth, head_age) = level.diagnostics();
        info!(
            "[{}] Outbox queue '{}' is full ({} of {} queued, head waiting for {} msec); blocking until space is available",
            self.log_descriptor,
            level.priority,
            depth,
            level.capacity,
            head_age.map(|age| age.as_millis()).unwrap_or(0)
        );

        let permit = level
            .free_slots
            .acquire()
            .await
            .map_err(|_| OutboxError::Closed)?;
        permit.forget();
        level.push(item);
        debug!(
            "[{}] Resumed after waiting for space in outbox queue '{}'",
            self.log_descriptor, level.priority
        );
        Ok(())
    }

    /// Enqueue an item, or fail immediately if its priority level is full
    ///
    /// The rejected item is not stored.
    pub fn submit_or_fail(&self, item: MessageBlockWithMetadata) -> Result<(), OutboxError> {
        let level = self.level(item.priority);
        if level.try_reserve()? {
            level.push(item);
            Ok(())
        } else {
            Err(level.capacity_exceeded())
        }
    }

    /// Remove the head of the highest non-empty priority level
    pub fn take_next(&self) -> Option<MessageBlockWithMetadata> {
        self.levels.iter().rev().find_map(LevelQueue::pop)
    }

    /// Discard every queued item; returns the number discarded
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        while self.take_next().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Reject all further submissions and wake waiting producers
    ///
    /// Items already queued stay available to [`Self::take_next`].
    pub fn close(&self) {
        for level in &self.levels {
            level.free_slots.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.levels.iter().all(|level| level.free_slots.is_closed())
    }

    /// Number of items queued at the given priority
    pub fn len(&self, priority: MessagePriority) -> usize {
        self.level(priority).items.lock().len()
    }

    pub fn total_len(&self) -> usize {
        self.levels.iter().map(|level| level.items.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Configured capacity of the given priority
    pub fn capacity(&self, priority: MessagePriority) -> usize {
        self.level(priority).capacity
    }
}
