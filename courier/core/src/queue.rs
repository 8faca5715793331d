//! Priority Message Queue
//!
//! Outbound scheduler with one bounded FIFO per [`Priority`] tier.
//!
//! - `dequeue` always drains the highest non-empty tier (Critical > High >
//!   Normal > Low), FIFO within a tier.
//! - `enqueue` on a full tier fails immediately with
//!   [`DeliveryError::QueueFull`]; producers see backpressure instead of
//!   blocking.
//!
//! Scheduling is strict: under sustained high-priority load, lower tiers wait
//! indefinitely. Tier capacities bound how much they can accumulate meanwhile.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{DeliveryError, Result};
use crate::messages::Priority;

/// Tier capacities and dispatch concurrency
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the critical tier
    pub critical: usize,
    /// Capacity of the high tier
    pub high: usize,
    /// Capacity of the normal tier
    pub normal: usize,
    /// Capacity of the low tier
    pub low: usize,
    /// Sends the dispatcher runs concurrently
    pub max_in_flight: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            critical: 256,
            high: 1024,
            normal: 4096,
            low: 8192,
            max_in_flight: 64,
        }
    }
}

impl QueueConfig {
    /// Capacity of `priority`'s tier
    #[must_use]
    pub fn capacity(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

struct Tiers<T> {
    /// Indexed by `Priority::index`
    queues: [VecDeque<T>; 4],
    closed: bool,
}

/// Bounded multi-tier queue
pub struct PriorityMessageQueue<T> {
    capacities: [usize; 4],
    tiers: Mutex<Tiers<T>>,
    notify: Notify,
}

impl<T> PriorityMessageQueue<T> {
    /// Create an empty queue
    pub fn new(config: &QueueConfig) -> Self {
        let mut capacities = [0; 4];
        for priority in Priority::DESCENDING {
            capacities[priority.index()] = config.capacity(priority);
        }

        Self {
            capacities,
            tiers: Mutex::new(Tiers {
                queues: Default::default(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append `item` to its tier
    ///
    /// # Errors
    ///
    /// - `QueueFull` if the tier is at capacity
    /// - `Shutdown` if the queue has been closed
    pub fn enqueue(&self, item: T, priority: Priority) -> Result<()> {
        {
            let mut tiers = self.tiers.lock();
            if tiers.closed {
                return Err(DeliveryError::Shutdown);
            }

            let capacity = self.capacities[priority.index()];
            let queue = &mut tiers.queues[priority.index()];
            if queue.len() >= capacity {
                tracing::debug!(%priority, capacity, "Queue tier full");
                return Err(DeliveryError::QueueFull { priority, capacity });
            }
            queue.push_back(item);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest item of the highest non-empty tier
    pub fn dequeue(&self) -> Option<(T, Priority)> {
        let mut tiers = self.tiers.lock();
        Priority::DESCENDING.into_iter().find_map(|priority| {
            tiers.queues[priority.index()]
                .pop_front()
                .map(|item| (item, priority))
        })
    }

    /// Wait for the next item; `None` once the queue is closed
    ///
    /// Intended for a single consumer.
    pub async fn dequeue_wait(&self) -> Option<(T, Priority)> {
        loop {
            if self.tiers.lock().closed {
                return None;
            }
            if let Some(next) = self.dequeue() {
                return Some(next);
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items and wake the consumer
    pub fn close(&self) {
        self.tiers.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Remove everything still queued, highest tier first
    pub fn drain(&self) -> Vec<(T, Priority)> {
        let mut tiers = self.tiers.lock();
        let mut drained = Vec::new();
        for priority in Priority::DESCENDING {
            drained.extend(
                tiers.queues[priority.index()]
                    .drain(..)
                    .map(|item| (item, priority)),
            );
        }
        drained
    }

    /// Items queued at `priority`
    pub fn tier_len(&self, priority: Priority) -> usize {
        self.tiers.lock().queues[priority.index()].len()
    }

    /// Items queued across all tiers
    pub fn len(&self) -> usize {
        self.tiers.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Whether every tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.tiers.lock().closed
    }
}

impl<T> std::fmt::Debug for PriorityMessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityMessageQueue")
            .field("len", &self.len())
            .field("capacities", &self.capacities)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(capacity: usize) -> PriorityMessageQueue<&'static str> {
        PriorityMessageQueue::new(&QueueConfig {
            critical: capacity,
            high: capacity,
            normal: capacity,
            low: capacity,
            max_in_flight: 1,
        })
    }

    #[test]
    fn test_higher_priority_dequeued_first() {
        let q = queue(10);
        q.enqueue("low-1", Priority::Low).unwrap();
        q.enqueue("normal-1", Priority::Normal).unwrap();
        q.enqueue("low-2", Priority::Low).unwrap();
        q.enqueue("critical-1", Priority::Critical).unwrap();
        q.enqueue("high-1", Priority::High).unwrap();
        q.enqueue("normal-2", Priority::Normal).unwrap();

        let order: Vec<&str> = std::iter::from_fn(|| q.dequeue().map(|(m, _)| m)).collect();
        assert_eq!(
            order,
            vec!["critical-1", "high-1", "normal-1", "normal-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_full_tier_rejects_without_affecting_others() {
        let q = queue(2);
        q.enqueue("a", Priority::Low).unwrap();
        q.enqueue("b", Priority::Low).unwrap();

        let err = q.enqueue("c", Priority::Low).unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::QueueFull {
                priority: Priority::Low,
                capacity: 2
            }
        ));

        q.enqueue("d", Priority::High).unwrap();
        assert_eq!(q.tier_len(Priority::Low), 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let q = queue(4);
        q.enqueue("a", Priority::Normal).unwrap();
        q.enqueue("b", Priority::Critical).unwrap();
        q.close();

        assert!(matches!(
            q.enqueue("c", Priority::High),
            Err(DeliveryError::Shutdown)
        ));
        let drained: Vec<&str> = q.drain().into_iter().map(|(m, _)| m).collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_wait_wakes_on_enqueue() {
        let q = Arc::new(queue(4));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue_wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue("wake", Priority::Normal).unwrap();

        let (item, priority) = consumer.await.unwrap().unwrap();
        assert_eq!(item, "wake");
        assert_eq!(priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_dequeue_wait_returns_none_after_close() {
        let q = Arc::new(queue(4));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue_wait().await })
        };

        tokio::task::yield_now().await;
        q.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
