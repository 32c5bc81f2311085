//! RabbitMQ queue backend using lapin.
//!
//! The producer side keeps one confirm-mode channel and reconnects lazily
//! when it drops. The consumer side keeps a separate channel with prefetch
//! set to the receive batch size.
//!
//! RabbitMQ has no per-message visibility timeout, so it is emulated here:
//! every delivery handed out by `receive` is tracked with a deadline, and
//! deliveries still unacknowledged past their deadline are nacked with
//! `requeue = true` at the start of the next `receive`, making them available
//! to any consumer again.
//!
//! Delivery tags restart at 1 on every channel, so receipt handles carry the
//! consumer generation as well: `<generation>.<delivery tag>`. A handle from
//! a previous consumer channel is rejected instead of acknowledging whatever
//! now holds the same tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{Consumer, Message, Producer, ReceiveOptions};
use crate::error::IntakeError;

/// Consumer tag announced to the broker.
const CONSUMER_TAG: &str = "contact-worker";

/// RabbitMQ-backed queue. Clones share the same connection.
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpQueueInner>,
}

struct AmqpQueueInner {
    url: String,
    queue: String,
    connection: RwLock<Option<Connection>>,
    publish_channel: RwLock<Option<Channel>>,
    consumer: Mutex<Option<ConsumerState>>,
    /// Bumped every time a consumer channel is opened
    generation: AtomicU64,
}

struct ConsumerState {
    channel: Channel,
    stream: lapin::Consumer,
    prefetch: u16,
    in_flight: InFlight,
}

/// Deliveries handed out on one consumer channel and their visibility
/// deadlines.
#[derive(Debug)]
struct InFlight {
    generation: u64,
    deadlines: HashMap<u64, Instant>,
}

impl InFlight {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            deadlines: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Start the visibility window for `tag`. Returns its receipt handle.
    fn track(&mut self, tag: u64, deadline: Instant) -> String {
        self.deadlines.insert(tag, deadline);
        format!("{}.{}", self.generation, tag)
    }

    /// Remove and return the tags whose window has elapsed, lowest first.
    fn take_expired(&mut self, now: Instant) -> Vec<u64> {
        let mut expired: Vec<u64> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        expired.sort_unstable();

        for tag in &expired {
            self.deadlines.remove(tag);
        }
        expired
    }

    /// Wait budget for one receive. When every prefetch slot is held the
    /// broker sends nothing more, so wake up in time to release the earliest
    /// delivery.
    fn wait_budget(&self, wait: Duration, prefetch: u16, now: Instant) -> Duration {
        if self.deadlines.len() < usize::from(prefetch) {
            return wait;
        }

        self.deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now).min(wait))
            .unwrap_or(wait)
    }

    /// Resolve a receipt handle to a delivery tag and stop tracking it.
    fn take(&mut self, receipt_handle: &str) -> Result<u64> {
        let (generation, tag) = receipt_handle
            .split_once('.')
            .and_then(|(g, t)| Some((g.parse::<u64>().ok()?, t.parse::<u64>().ok()?)))
            .ok_or_else(|| anyhow!("Malformed receipt handle {receipt_handle}"))?;

        if generation != self.generation {
            bail!("Receipt handle {receipt_handle} belongs to a previous consumer channel");
        }

        if self.deadlines.remove(&tag).is_none() {
            bail!("Receipt handle {receipt_handle} is unknown or its visibility window elapsed");
        }

        Ok(tag)
    }
}

/// Collect up to `limit` items that are already buffered, without waiting.
fn take_ready<S>(stream: &mut S, limit: usize) -> Vec<S::Item>
where
    S: Stream + Unpin,
{
    let mut items = Vec::new();
    while items.len() < limit {
        match stream.next().now_or_never() {
            Some(Some(item)) => items.push(item),
            _ => break,
        }
    }
    items
}

fn prefetch_for(max_messages: usize) -> u16 {
    u16::try_from(max_messages.max(1)).unwrap_or(u16::MAX)
}

/// Drop the consumer, closing its channel so the broker requeues whatever
/// it still holds unacknowledged.
async fn reset_consumer(slot: &mut Option<ConsumerState>, reason: &str) {
    if let Some(old) = slot.take() {
        if old.channel.status().connected() {
            if let Err(e) = old.channel.close(200, reason).await {
                warn!(error = %e, "rabbitmq_consumer_channel_close_error");
            }
        }
        info!(
            generation = old.in_flight.generation,
            released = old.in_flight.len(),
            reason = reason,
            "rabbitmq_consumer_reset"
        );
    }
}

impl AmqpQueue {
    /// Create a queue handle. No connection is made until first use.
    pub fn new(url: String, queue: String) -> Self {
        Self {
            inner: Arc::new(AmqpQueueInner {
                url,
                queue,
                connection: RwLock::new(None),
                publish_channel: RwLock::new(None),
                consumer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    /// Connect and start consuming right away, so an unreachable broker is
    /// reported at startup instead of on the first receive.
    pub async fn connect(&self, max_messages: usize) -> Result<()> {
        let mut slot = self.inner.consumer.lock().await;
        self.ensure_consumer(&mut slot, prefetch_for(max_messages))
            .await?;
        Ok(())
    }

    /// Open a channel on the shared connection, reconnecting if needed, and
    /// declare the queue on it.
    async fn open_channel(&self) -> Result<Channel> {
        let mut connection = self.inner.connection.write().await;

        let connected = connection
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false);

        if !connected {
            info!(url_length = self.inner.url.len(), "rabbitmq_connecting");

            let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
                .await
                .context("Failed to connect to RabbitMQ")?;

            info!("rabbitmq_connected");
            *connection = Some(conn);
        }

        let conn = connection
            .as_ref()
            .ok_or_else(|| anyhow!("RabbitMQ connection unavailable"))?;

        let channel = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        // Declaring is idempotent; the queue is durable so messages survive
        // broker restarts.
        channel
            .queue_declare(
                &self.inner.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare queue")?;

        info!(queue = %self.inner.queue, "rabbitmq_queue_declared");

        Ok(channel)
    }

    /// Get the publishing channel, creating it on first use or after a drop.
    async fn publish_channel(&self) -> Result<Channel> {
        {
            let channel = self.inner.publish_channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut channel = self.inner.publish_channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        let ch = self.open_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        *channel = Some(ch.clone());
        Ok(ch)
    }

    async fn publish(&self, email: &str) -> Result<()> {
        let channel = self.publish_channel().await?;

        let confirmation = channel
            .basic_publish(
                "",
                &self.inner.queue,
                BasicPublishOptions::default(),
                email.as_bytes(),
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("text/plain".into()),
            )
            .await
            .context("Failed to publish to queue")?
            .await
            .context("Failed to confirm publish")?;

        if confirmation.is_nack() {
            bail!("Broker rejected message");
        }

        Ok(())
    }

    /// Start (or restart) consuming when there is no healthy consumer or the
    /// batch size changed.
    async fn ensure_consumer<'a>(
        &self,
        slot: &'a mut Option<ConsumerState>,
        prefetch: u16,
    ) -> Result<&'a mut ConsumerState> {
        let healthy = slot
            .as_ref()
            .map(|s| s.channel.status().connected() && s.prefetch == prefetch)
            .unwrap_or(false);

        if !healthy {
            reset_consumer(slot, "Resetting consumer").await;

            let channel = self.open_channel().await?;
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .context("Failed to set QoS")?;

            let stream = channel
                .basic_consume(
                    &self.inner.queue,
                    CONSUMER_TAG,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .context("Failed to start consumer")?;

            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

            info!(
                queue = %self.inner.queue,
                prefetch_count = prefetch,
                generation = generation,
                "rabbitmq_consumer_started"
            );

            *slot = Some(ConsumerState {
                channel,
                stream,
                prefetch,
                in_flight: InFlight::new(generation),
            });
        }

        slot.as_mut()
            .ok_or_else(|| anyhow!("RabbitMQ consumer unavailable"))
    }

    /// Close channels and the connection.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut publish_channel = self.inner.publish_channel.write().await;
        let mut consumer = self.inner.consumer.lock().await;

        reset_consumer(&mut consumer, "Normal shutdown").await;

        if let Some(ch) = publish_channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!(queue = %self.inner.queue, "rabbitmq_queue_closed");
    }
}

impl ConsumerState {
    /// Requeue deliveries whose visibility window has elapsed.
    async fn release_expired(&mut self, queue: &str) {
        for tag in self.in_flight.take_expired(Instant::now()) {
            match self
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => warn!(queue = queue, delivery_tag = tag, "rabbitmq_visibility_expired"),
                Err(e) => error!(delivery_tag = tag, error = %e, "rabbitmq_nack_failed"),
            }
        }
    }

    fn track(&mut self, delivery: Delivery, visibility_timeout: Duration) -> Message {
        let receipt_handle = self
            .in_flight
            .track(delivery.delivery_tag, Instant::now() + visibility_timeout);

        Message {
            body: String::from_utf8_lossy(&delivery.data).into_owned(),
            receipt_handle,
            redelivered: delivery.redelivered,
        }
    }
}

#[async_trait]
impl Producer for AmqpQueue {
    async fn enqueue(&self, email: &str) -> Result<(), IntakeError> {
        match self.publish(email).await {
            Ok(()) => {
                info!(queue = %self.inner.queue, email = %email, "rabbitmq_contact_published");
                Ok(())
            }
            Err(e) => {
                // Drop the channel so the next publish reconnects.
                self.inner.publish_channel.write().await.take();
                error!(queue = %self.inner.queue, error = %format!("{e:#}"), "rabbitmq_publish_failed");
                Err(IntakeError::queue(format!("{e:#}")))
            }
        }
    }
}

#[async_trait]
impl Consumer for AmqpQueue {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let mut slot = self.inner.consumer.lock().await;
        let state = self
            .ensure_consumer(&mut slot, prefetch_for(options.max_messages))
            .await?;

        state.release_expired(&self.inner.queue).await;

        let wait = state
            .in_flight
            .wait_budget(options.wait, state.prefetch, Instant::now());
        let first = match tokio::time::timeout(wait, state.stream.next()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(next) => next,
        };

        let delivery = match first {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                reset_consumer(&mut slot, "Delivery error").await;
                return Err(e).context("RabbitMQ delivery error");
            }
            None => {
                reset_consumer(&mut slot, "Consumer stream ended").await;
                bail!("RabbitMQ consumer closed");
            }
        };

        let mut messages = vec![state.track(delivery, options.visibility_timeout)];

        // Drain whatever else is already buffered, without waiting.
        let room = options.max_messages.saturating_sub(messages.len());
        for item in take_ready(&mut state.stream, room) {
            match item {
                Ok(delivery) => messages.push(state.track(delivery, options.visibility_timeout)),
                Err(e) => error!(error = %e, "rabbitmq_delivery_error"),
            }
        }

        info!(
            queue = %self.inner.queue,
            count = messages.len(),
            in_flight = state.in_flight.len(),
            "rabbitmq_messages_received"
        );

        Ok(messages)
    }

    async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
        let mut slot = self.inner.consumer.lock().await;
        let state = slot
            .as_mut()
            .ok_or_else(|| anyhow!("No active consumer for receipt handle {receipt_handle}"))?;

        let tag = state.in_flight.take(receipt_handle)?;

        state
            .channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .context("Failed to acknowledge message")?;

        Ok(())
    }
}
