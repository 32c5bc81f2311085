//! Record store for accepted contact requests.
//!
//! A record is keyed by the email address and has no other mutable
//! attributes, so `save` is an idempotent upsert.
//!
//! ## Backends
//!
//! - [`MemoryRecordStore`]: process-local, used in tests and local runs
//! - [`FileRecordStore`]: one JSON table file per configured table name

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IntakeError;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

/// Persisted representation of one contact request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key
    pub email: String,
}

impl Record {
    pub fn new(email: impl Into<String>) -> Self {
        Self { email: email.into() }
    }
}

/// Durable, idempotent persistence keyed by address.
///
/// Callers are expected to validate the address first; implementations do
/// not re-validate. Every backend fault must surface as
/// [`IntakeError::Persistence`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert the record for `email`.
    async fn save(&self, email: &str) -> Result<(), IntakeError>;

    /// Fetch the record for `email`, if present.
    async fn get(&self, email: &str) -> Result<Option<Record>, IntakeError>;

    /// Number of records in the table.
    async fn count(&self) -> Result<usize, IntakeError>;
}
