//! Intake orchestration: validate → persist → enqueue.
//!
//! Each stage short-circuits on failure and its error is mapped to a
//! distinct status: 400 for a bad address, 500 for a storage or queue fault.
//! A save that succeeds followed by a failed enqueue is not rolled back; the
//! record stays and a client retry re-saves idempotently.

use std::sync::Arc;

use axum::http::StatusCode;
use tracing::{error, info, warn};

use crate::error::IntakeError;
use crate::queue::Producer;
use crate::store::RecordStore;
use crate::validate::Validator;

/// Client-visible result of one intake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub message: String,
    pub status: StatusCode,
}

impl IntakeOutcome {
    fn accepted(email: &str) -> Self {
        Self {
            message: success_message(email),
            status: StatusCode::OK,
        }
    }

    fn failed(err: &IntakeError) -> Self {
        Self {
            message: err.to_string(),
            status: err.status(),
        }
    }
}

/// Message returned when a contact request has been accepted.
pub fn success_message(email: &str) -> String {
    format!(
        "Successfully received contact request. You should receive an email shortly on {email} with my contact information."
    )
}

/// Composes the validator, record store and queue producer.
#[derive(Clone)]
pub struct IntakeService {
    validator: Arc<dyn Validator>,
    store: Arc<dyn RecordStore>,
    producer: Arc<dyn Producer>,
}

impl IntakeService {
    pub fn new(
        validator: Arc<dyn Validator>,
        store: Arc<dyn RecordStore>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            validator,
            store,
            producer,
        }
    }

    /// Run one contact request through the pipeline.
    pub async fn handle(&self, email: &str) -> IntakeOutcome {
        match self.submit(email).await {
            Ok(()) => {
                info!(email = %email, "intake_accepted");
                IntakeOutcome::accepted(email)
            }
            Err(err) => {
                match &err {
                    IntakeError::InvalidAddress(_) => {
                        warn!(email_length = email.len(), "intake_invalid_address")
                    }
                    IntakeError::Persistence(cause) => {
                        error!(email = %email, error = %cause, "intake_persist_failed")
                    }
                    IntakeError::Queue(cause) => {
                        error!(email = %email, error = %cause, "intake_enqueue_failed")
                    }
                }
                IntakeOutcome::failed(&err)
            }
        }
    }

    async fn submit(&self, email: &str) -> Result<(), IntakeError> {
        self.validator.validate(email)?;
        self.store.save(email).await?;
        self.producer.enqueue(email).await?;
        Ok(())
    }
}
