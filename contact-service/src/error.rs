//! Error types for the contact pipeline.
//!
//! `IntakeError` is the typed failure returned by the three intake stages.
//! Its `Display` output is exactly the carried message, because that message
//! is what ends up in the client-visible response body.

use axum::http::StatusCode;
use thiserror::Error;

/// Message returned for any address that fails validation.
pub const INVALID_ADDRESS_MESSAGE: &str = "The provided email is invalid";

/// Failure of one of the intake stages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// The address did not pass validation (client fault)
    #[error("{0}")]
    InvalidAddress(String),

    /// The record store could not persist the address
    #[error("{0}")]
    Persistence(String),

    /// The queue rejected or failed to accept the message
    #[error("{0}")]
    Queue(String),
}

impl IntakeError {
    /// Address rejected with the standard validator message.
    pub fn invalid_address() -> Self {
        Self::InvalidAddress(INVALID_ADDRESS_MESSAGE.to_string())
    }

    /// Wrap a storage fault, keeping only its description.
    pub fn persistence(cause: impl std::fmt::Display) -> Self {
        Self::Persistence(cause.to_string())
    }

    /// Wrap a queue fault, keeping only its description.
    pub fn queue(cause: impl std::fmt::Display) -> Self {
        Self::Queue(cause.to_string())
    }

    /// HTTP status the failure maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            Self::Persistence(_) | Self::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Startup configuration errors. These are always fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_bare_message() {
        assert_eq!(IntakeError::invalid_address().to_string(), INVALID_ADDRESS_MESSAGE);
        assert_eq!(
            IntakeError::persistence("failed to save email").to_string(),
            "failed to save email"
        );
        assert_eq!(
            IntakeError::Queue("failed to send email to queue".into()).to_string(),
            "failed to send email to queue"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(IntakeError::invalid_address().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            IntakeError::persistence("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(IntakeError::queue("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
