//! Contact intake - validate, record and queue contact requests.
//!
//! This library provides shared modules for the two binaries:
//! - `contact-web`: HTTP intake server
//! - `contact-worker`: queue consumer that triggers notifications
//!
//! ## Architecture
//!
//! ```text
//! POST /email → IntakeService → [Validator, RecordStore, Producer] → response
//! Worker → Consumer (long-poll) → Notifier → acknowledge
//! ```

pub mod config;
pub mod error;
pub mod intake;
pub mod notify;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod validate;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, IntakeError};
pub use intake::{IntakeOutcome, IntakeService};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use queue::{AmqpQueue, Consumer, MemoryQueue, Message, Producer, ReceiveOptions};
pub use store::{FileRecordStore, MemoryRecordStore, Record, RecordStore};
pub use validate::{EmailValidator, Validator};
pub use web::AppState;
pub use worker::Worker;
