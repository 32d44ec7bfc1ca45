// src/api/queue.rs
//! Bounded four-tier priority queue
//!
//! Dequeue always serves the oldest item of the highest non-empty tier.
//! Lower tiers can starve under sustained high-priority load.

use crate::api::types::RequestPriority;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Items waiting longer than this fail without being dispatched
    pub queue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            queue_timeout_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// A push refused at capacity, handing the item back to the caller
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: GatewayError,
    pub item: T,
}

#[derive(Debug)]
pub struct QueuedItem<T> {
    pub item: T,
    pub priority: RequestPriority,
    pub enqueued_at: Instant,
}

/// Pending items per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

pub struct PriorityRequestQueue<T> {
    tiers: Mutex<[VecDeque<QueuedItem<T>>; 4]>,
    available: Notify,
    max_size: usize,
}

impl<T> PriorityRequestQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            tiers: Mutex::new(Default::default()),
            available: Notify::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Enqueue, failing fast at capacity
    pub async fn push(&self, priority: RequestPriority, item: T) -> std::result::Result<(), Rejected<T>> {
        {
            let mut tiers = self.tiers.lock().await;
            let depth: usize = tiers.iter().map(VecDeque::len).sum();
            if depth >= self.max_size {
                return Err(Rejected {
                    error: GatewayError::QueueFull {
                        depth,
                        capacity: self.max_size,
                    },
                    item,
                });
            }
            tiers[priority.index()].push_back(QueuedItem {
                item,
                priority,
                enqueued_at: Instant::now(),
            });
        }
        self.available.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Option<QueuedItem<T>> {
        let mut tiers = self.tiers.lock().await;
        RequestPriority::ALL
            .iter()
            .find_map(|p| tiers[p.index()].pop_front())
    }

    /// Wait up to `timeout` for the next item
    pub async fn pop(&self, timeout: Duration) -> Option<QueuedItem<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop().await {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.tiers.lock().await.iter().map(VecDeque::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn depth(&self) -> QueueDepth {
        let tiers = self.tiers.lock().await;
        QueueDepth {
            critical: tiers[RequestPriority::Critical.index()].len(),
            high: tiers[RequestPriority::High.index()].len(),
            normal: tiers[RequestPriority::Normal.index()].len(),
            low: tiers[RequestPriority::Low.index()].len(),
        }
    }

    /// Remove everything, highest tier first
    pub async fn drain(&self) -> Vec<QueuedItem<T>> {
        let mut tiers = self.tiers.lock().await;
        RequestPriority::ALL
            .iter()
            .flat_map(|p| std::mem::take(&mut tiers[p.index()]))
            .collect()
    }
}
