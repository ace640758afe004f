//! Dispatch queue between the scheduler loop and workers.
//!
//! Delivery is at-least-once: a received task stays in flight until it is
//! acked, and reappears if its visibility timeout passes first. Ordering is
//! best-effort FIFO. Workers must tolerate duplicates; the claim token on
//! each task lets the store reject stale ones.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    types::DispatchTask,
};

/// A task handed to a consumer, plus the receipt used to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task: DispatchTask,
    pub receipt: String,
    /// 1 on first delivery, higher after redelivery.
    pub delivery_count: u32,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, task: DispatchTask) -> Result<()>;

    /// Wait until a task is visible and take it.
    async fn receive(&self) -> Result<Delivery>;

    /// Settle a delivery. Unknown or expired receipts are ignored.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Return a delivery to the queue for immediate redelivery.
    async fn nack(&self, receipt: &str) -> Result<()>;

    /// Tasks not yet acked (ready plus in flight).
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug)]
struct Entry {
    task: DispatchTask,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    in_flight: HashMap<String, InFlight>,
}

impl State {
    /// Move in-flight entries whose visibility lapsed back to the front.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                debug!(run_id = %f.entry.task.run_id, "visibility timeout lapsed; redelivering");
                self.ready.push_front(f.entry);
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }

    fn len(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }
}

/// In-process [`DispatchQueue`].
///
/// Contents are lost with the process. Runs behind lost tasks keep their
/// lease in the store and are re-dispatched once the lease sweep resets them.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
    capacity: usize,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
            capacity,
        }
    }

    pub fn from_config(config: &cronhook_core::config::QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(config.visibility_timeout_ms),
            config.capacity,
        )
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn enqueue(&self, task: DispatchTask) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.len() >= self.capacity {
            return Err(SchedulerError::Queue(format!(
                "queue is full ({} tasks)",
                self.capacity
            )));
        }
        debug!(run_id = %task.run_id, attempt = task.attempt, "task enqueued");
        state.ready.push_back(Entry {
            task,
            deliveries: 0,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.requeue_expired(now);
                if let Some(mut entry) = state.ready.pop_front() {
                    entry.deliveries += 1;
                    let delivery = Delivery {
                        task: entry.task.clone(),
                        receipt: Uuid::new_v4().to_string(),
                        delivery_count: entry.deliveries,
                    };
                    state.in_flight.insert(
                        delivery.receipt.clone(),
                        InFlight {
                            entry,
                            visible_at: now + self.visibility_timeout,
                        },
                    );
                    // Leave a wake-up for any other consumer if work remains.
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(delivery);
                }
                state.next_visible_at()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(receipt).is_none() {
            debug!(receipt, "ack for unknown receipt ignored");
        }
        Ok(())
    }

    async fn nack(&self, receipt: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.in_flight.remove(receipt) {
            Some(f) => {
                state.ready.push_front(f.entry);
                drop(state);
                self.notify.notify_one();
            }
            None => debug!(receipt, "nack for unknown receipt ignored"),
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}
