//! Contact request queue.
//!
//! This module provides:
//! - The producer seam used by the intake path
//! - The consumer seam (long-poll receive + acknowledge) used by the worker
//! - An in-process queue and a RabbitMQ queue implementing both
//!
//! ## Architecture
//!
//! ```text
//! Web Server → contact queue → Worker → Notifier
//! ```
//!
//! Delivery is at-least-once. A received message that is not acknowledged
//! within its visibility window is delivered again.

pub mod amqp;
pub mod memory;
pub mod message;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::IntakeError;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;
pub use message::{
    Message, ReceiveOptions, DEFAULT_MAX_MESSAGES, DEFAULT_VISIBILITY_TIMEOUT, DEFAULT_WAIT,
};

/// Sending side of the queue.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Place one message carrying `email` on the queue.
    ///
    /// On error the caller must not assume either outcome.
    async fn enqueue(&self, email: &str) -> Result<(), IntakeError>;
}

/// Receiving side of the queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait up to `options.wait` for messages. Returns an empty batch on timeout.
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<Message>>;

    /// Permanently remove a received message.
    async fn acknowledge(&self, receipt_handle: &str) -> Result<()>;
}
