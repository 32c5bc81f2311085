//! Address validation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::IntakeError;

/// Anchored so that a valid address embedded in a longer string is rejected.
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,7}$")
        .expect("email pattern is a valid regex")
});

/// Classifies an address as well-formed or not.
pub trait Validator: Send + Sync {
    fn validate(&self, address: &str) -> Result<(), IntakeError>;
}

/// Pattern-based email validator.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmailValidator;

impl Validator for EmailValidator {
    fn validate(&self, address: &str) -> Result<(), IntakeError> {
        if EMAIL_PATTERN.is_match(address) {
            Ok(())
        } else {
            Err(IntakeError::invalid_address())
        }
    }
}
