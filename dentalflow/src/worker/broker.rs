//! Work queue between submitters and workers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::core::{Job, JobId};
use crate::utils::{now_utc, Timestamp};

/// A queued unit of work referring to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// The job to run.
    pub job_id: JobId,
    /// Its type.
    pub job_type: String,
    /// Higher runs sooner.
    pub priority: i32,
    /// Correlation id of the job.
    pub correlation_id: String,
    /// Retries consumed when the item was queued.
    pub attempt: u32,
}

impl WorkItem {
    /// Builds the item for the job's next attempt.
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            correlation_id: job.correlation_id.clone(),
            attempt: job.retry_count,
        }
    }
}

/// An item that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The item.
    pub item: WorkItem,
    /// Last failure.
    pub reason: String,
    /// When it was dead-lettered.
    pub at: Timestamp,
}

/// Broker failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker no longer accepts work.
    #[error("Broker is closed")]
    Closed,
}

/// A queue with delayed visibility and a dead-letter channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queues an item, visible after `delay`.
    async fn enqueue(&self, item: WorkItem, delay: Duration) -> Result<(), BrokerError>;

    /// Waits for the next visible item.
    ///
    /// Returns `None` once the broker is closed and no item is visible.
    async fn receive(&self) -> Option<WorkItem>;

    /// Routes an item to the dead-letter channel.
    async fn dead_letter(&self, item: WorkItem, reason: String) -> Result<(), BrokerError>;

    /// Everything dead-lettered so far.
    async fn dead_letters(&self) -> Vec<DeadLetter>;

    /// Stops accepting work and wakes every waiting receiver.
    fn close(&self);
}

#[derive(Debug)]
struct Ready {
    priority: i32,
    seq: u64,
    item: WorkItem,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

#[derive(Debug)]
struct Delayed {
    visible_at: Instant,
    seq: u64,
    item: WorkItem,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visible_at
            .cmp(&other.visible_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn promote(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(d)| d.visible_at <= now)
        {
            if let Some(Reverse(d)) = self.delayed.pop() {
                self.ready.push(Ready {
                    priority: d.item.priority,
                    seq: d.seq,
                    item: d.item,
                });
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-process [`Broker`].
///
/// Visible items are served highest priority first, then in the order
/// they became visible to the queue (FIFO by enqueue order).
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<QueueState>,
    dead: Mutex<Vec<DeadLetter>>,
    notify: Notify,
}

impl InMemoryBroker {
    /// Creates an open, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Items currently visible.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        let mut state = self.state.lock();
        state.promote(Instant::now());
        state.ready.len()
    }

    /// Items waiting for their delay to pass.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        let mut state = self.state.lock();
        state.promote(Instant::now());
        state.delayed.len()
    }

    /// Returns true once [`Broker::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, item: WorkItem, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let seq = state.next_seq();
            debug!(job_id = %item.job_id, delay_ms = delay.as_millis(), "Enqueued work item");
            if delay.is_zero() {
                state.ready.push(Ready {
                    priority: item.priority,
                    seq,
                    item,
                });
            } else {
                state.delayed.push(Reverse(Delayed {
                    visible_at: Instant::now() + delay,
                    seq,
                    item,
                }));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock();
                state.promote(Instant::now());
                if let Some(ready) = state.ready.pop() {
                    return Some(ready.item);
                }
                if state.closed {
                    return None;
                }
                state.delayed.peek().map(|Reverse(d)| d.visible_at)
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn dead_letter(&self, item: WorkItem, reason: String) -> Result<(), BrokerError> {
        self.dead.lock().push(DeadLetter {
            item,
            reason,
            at: now_utc(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().clone()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}
