//! In-process queue with visibility timeouts.
//!
//! Behaves like a hosted queue for a single process: long-poll receive,
//! per-delivery receipt handles, and redelivery of messages that are not
//! acknowledged before their visibility window elapses. Used by tests and by
//! `QUEUE_BACKEND=memory` local runs where web and worker share one process.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::{Consumer, Message, Producer, ReceiveOptions};
use crate::error::IntakeError;

#[derive(Debug)]
struct Entry {
    body: String,
    deliveries: u32,
    invisible_until: Option<Instant>,
    receipt_handle: Option<String>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    next_receipt: u64,
}

/// Shared in-process queue. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

#[derive(Debug)]
struct MemoryQueueInner {
    name: String,
    state: Mutex<State>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryQueueInner {
                name: name.into(),
                state: Mutex::new(State::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Messages not yet acknowledged, in flight or not.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Take up to `options.max_messages` visible entries, or report when the
    /// earliest in-flight entry becomes visible again.
    async fn take_visible(&self, options: &ReceiveOptions) -> (Vec<Message>, Option<Instant>) {
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut messages = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for index in 0..state.entries.len() {
            if messages.len() >= options.max_messages {
                break;
            }

            if !state.entries[index].is_visible(now) {
                let until = state.entries[index].invisible_until;
                next_visible = match (next_visible, until) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                continue;
            }

            state.next_receipt += 1;
            let receipt_handle = format!("{}-{}", self.inner.name, state.next_receipt);

            let entry = &mut state.entries[index];
            entry.deliveries += 1;
            entry.invisible_until = Some(now + options.visibility_timeout);
            entry.receipt_handle = Some(receipt_handle.clone());

            messages.push(Message {
                body: entry.body.clone(),
                receipt_handle,
                redelivered: entry.deliveries > 1,
            });
        }

        (messages, next_visible)
    }
}

#[async_trait]
impl Producer for MemoryQueue {
    async fn enqueue(&self, email: &str) -> Result<(), IntakeError> {
        {
            let mut state = self.inner.state.lock().await;
            state.entries.push(Entry {
                body: email.to_string(),
                deliveries: 0,
                invisible_until: None,
                receipt_handle: None,
            });
        }
        self.inner.arrivals.notify_one();

        debug!(queue = %self.inner.name, email = %email, "memory_queue_enqueued");
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryQueue {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let deadline = Instant::now() + options.wait;

        loop {
            let (messages, next_visible) = self.take_visible(options).await;
            if !messages.is_empty() {
                return Ok(messages);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.inner.arrivals.notified() => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let position = state
            .entries
            .iter()
            .position(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| anyhow!("receipt handle {receipt_handle} is not valid"))?;

        let entry = state.entries.remove(position);
        info!(
            queue = %self.inner.name,
            email = %entry.body,
            deliveries = entry.deliveries,
            "memory_queue_acknowledged"
        );
        Ok(())
    }
}
