//! Consumer loop: long-poll the queue, notify, acknowledge.
//!
//! The loop alternates between polling and processing until its
//! cancellation token fires. Nothing that happens to a single message stops
//! it: a failed notification or acknowledgement is logged and the message is
//! left to reappear once its visibility window elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::queue::{Consumer, Message, ReceiveOptions};

/// Pause after a failed receive so an unreachable broker is not hammered.
pub const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Counters for one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acknowledged: usize,
    pub failed: usize,
}

/// A single consumer instance. Several may run against the same queue.
#[derive(Clone)]
pub struct Worker {
    consumer: Arc<dyn Consumer>,
    notifier: Arc<dyn Notifier>,
    options: ReceiveOptions,
}

impl Worker {
    pub fn new(
        consumer: Arc<dyn Consumer>,
        notifier: Arc<dyn Notifier>,
        options: ReceiveOptions,
    ) -> Self {
        Self {
            consumer,
            notifier,
            options,
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Poll and process until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_messages = self.options.max_messages,
            wait_seconds = self.options.wait.as_secs(),
            visibility_timeout_seconds = self.options.visibility_timeout.as_secs(),
            "worker_ready"
        );

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.receive(&self.options) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    self.process_batch(messages).await;
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "worker_receive_failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(RECEIVE_ERROR_PAUSE) => {}
                    }
                }
            }
        }

        info!("worker_stopped");
    }

    /// One poll cycle. Returns what happened to the batch.
    pub async fn poll_once(&self) -> anyhow::Result<BatchReport> {
        let messages = self.consumer.receive(&self.options).await?;
        Ok(self.process_batch(messages).await)
    }

    /// Process messages sequentially, in the order received.
    async fn process_batch(&self, messages: Vec<Message>) -> BatchReport {
        let mut report = BatchReport {
            received: messages.len(),
            ..Default::default()
        };

        for message in messages {
            if self.process_message(&message).await {
                report.acknowledged += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    async fn process_message(&self, message: &Message) -> bool {
        info!(
            email = %message.body,
            redelivered = message.redelivered,
            "worker_message_received"
        );

        if let Err(e) = self.notifier.notify(&message.body).await {
            // Not acknowledged: it comes back after the visibility timeout.
            warn!(email = %message.body, error = %format!("{e:#}"), "worker_notify_failed");
            return false;
        }

        if let Err(e) = self.consumer.acknowledge(&message.receipt_handle).await {
            error!(
                email = %message.body,
                receipt_handle = %message.receipt_handle,
                error = %format!("{e:#}"),
                "worker_ack_failed"
            );
            return false;
        }

        info!(email = %message.body, "worker_message_completed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;

    use crate::queue::{MemoryQueue, Producer};

    /// Remembers every address and fails for the ones listed.
    #[derive(Default)]
    struct ScriptedNotifier {
        seen: Mutex<Vec<String>>,
        fail_for: Vec<String>,
    }

    impl ScriptedNotifier {
        fn failing_for(emails: &[&str]) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_for: emails.iter().map(|e| e.to_string()).collect(),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for ScriptedNotifier {
        async fn notify(&self, email: &str) -> Result<()> {
            self.seen.lock().unwrap().push(email.to_string());
            if self.fail_for.iter().any(|e| e == email) {
                bail!("notification for {email} failed");
            }
            Ok(())
        }
    }

    /// Wraps a queue, counting receives and optionally failing them or acks.
    struct FlakyConsumer {
        queue: MemoryQueue,
        receives: AtomicUsize,
        fail_receives: usize,
        fail_acks: bool,
    }

    #[async_trait]
    impl Consumer for FlakyConsumer {
        async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
            let n = self.receives.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_receives {
                return Err(anyhow!("broker unavailable"));
            }
            self.queue.receive(options).await
        }

        async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
            if self.fail_acks {
                bail!("ack for {receipt_handle} timed out");
            }
            self.queue.acknowledge(receipt_handle).await
        }
    }

    fn options(visibility_ms: u64) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: 10,
            wait: Duration::from_millis(20),
            visibility_timeout: Duration::from_millis(visibility_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_notified_in_order_and_acknowledged() {
        let queue = MemoryQueue::new("contacts");
        for email in ["a@b.com", "c@d.com", "e@f.com"] {
            queue.enqueue(email).await.unwrap();
        }
        let notifier = Arc::new(ScriptedNotifier::default());
        let worker = Worker::new(Arc::new(queue.clone()), notifier.clone(), options(1_000));

        let report = worker.poll_once().await.unwrap();

        assert_eq!(
            report,
            BatchReport {
                received: 3,
                acknowledged: 3,
                failed: 0
            }
        );
        assert_eq!(notifier.seen(), vec!["a@b.com", "c@d.com", "e@f.com"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_is_not_an_error() {
        let queue = MemoryQueue::new("contacts");
        let worker = Worker::new(
            Arc::new(queue),
            Arc::new(ScriptedNotifier::default()),
            options(1_000),
        );

        assert_eq!(worker.poll_once().await.unwrap(), BatchReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_notification_is_redelivered() {
        let queue = MemoryQueue::new("contacts");
        queue.enqueue("bad@b.com").await.unwrap();
        queue.enqueue("good@b.com").await.unwrap();

        let notifier = Arc::new(ScriptedNotifier::failing_for(&["bad@b.com"]));
        let worker = Worker::new(Arc::new(queue.clone()), notifier.clone(), options(30));

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.len().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let redelivered = queue.receive(&options(30)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, "bad@b.com");
        assert!(redelivered[0].redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_polling_after_notifier_failure() {
        let queue = MemoryQueue::new("contacts");
        queue.enqueue("bad@b.com").await.unwrap();

        let consumer = Arc::new(FlakyConsumer {
            queue: queue.clone(),
            receives: AtomicUsize::new(0),
            fail_receives: 0,
            fail_acks: false,
        });
        let notifier = Arc::new(ScriptedNotifier::failing_for(&["bad@b.com"]));
        let worker = Worker::new(consumer.clone(), notifier.clone(), options(10));

        let shutdown = CancellationToken::new();
        let handle = worker.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(consumer.receives.load(Ordering::SeqCst) >= 2);
        // Redelivered at least once after the first failure.
        assert!(notifier.seen().len() >= 2);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_failure_does_not_stop_loop() {
        let queue = MemoryQueue::new("contacts");
        queue.enqueue("a@b.com").await.unwrap();

        let consumer = Arc::new(FlakyConsumer {
            queue: queue.clone(),
            receives: AtomicUsize::new(0),
            fail_receives: 0,
            fail_acks: true,
        });
        let notifier = Arc::new(ScriptedNotifier::default());
        let worker = Worker::new(consumer.clone(), notifier.clone(), options(1_000));

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(notifier.seen(), vec!["a@b.com"]);

        // Still usable afterwards.
        assert_eq!(worker.poll_once().await.unwrap(), BatchReport::default());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_pauses_then_recovers() {
        let queue = MemoryQueue::new("contacts");
        queue.enqueue("a@b.com").await.unwrap();

        let consumer = Arc::new(FlakyConsumer {
            queue: queue.clone(),
            receives: AtomicUsize::new(0),
            fail_receives: 1,
            fail_acks: false,
        });
        let notifier = Arc::new(ScriptedNotifier::default());
        let worker = Worker::new(consumer.clone(), notifier.clone(), options(1_000));

        let shutdown = CancellationToken::new();
        let handle = worker.spawn(shutdown.clone());

        // Nothing is received while the loop backs off.
        tokio::time::sleep(RECEIVE_ERROR_PAUSE - Duration::from_millis(100)).await;
        assert_eq!(consumer.receives.load(Ordering::SeqCst), 1);
        assert!(notifier.seen().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(notifier.seen(), vec!["a@b.com"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_long_poll() {
        let queue = MemoryQueue::new("contacts");
        let worker = Worker::new(
            Arc::new(queue),
            Arc::new(ScriptedNotifier::default()),
            ReceiveOptions {
                wait: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = worker.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled_at = tokio::time::Instant::now();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stops promptly")
            .unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    }
}
