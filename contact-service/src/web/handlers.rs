//! HTTP endpoint handlers.
//!
//! These handlers carry no logic of their own: they extract the address,
//! hand it to the intake service and serialize the outcome.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::intake::IntakeService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub intake: IntakeService,
}

impl AppState {
    pub fn new(intake: IntakeService) -> Self {
        Self { intake }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check endpoint. Always `{}`.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

// =============================================================================
// Contact Requests
// =============================================================================

/// Body of `POST /email`. A missing field is an empty address.
#[derive(Debug, Default, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

/// Body of every `/email` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Static text served on `GET /email`.
pub const EMAIL_USAGE: &str = r#"POST a JSON body {"email": "<address>"} to this endpoint"#;

/// `GET /email`.
pub async fn email_usage() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: EMAIL_USAGE.to_string(),
    })
}

/// `POST /email`.
///
/// An unreadable body is treated like a missing field, so the client gets
/// the validator's 400 rather than a framework error.
pub async fn submit_email(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> (StatusCode, Json<MessageResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "email_request_unreadable");
            EmailRequest::default()
        }
    };

    info!(email_length = request.email.len(), "email_request_received");

    let outcome = state.intake.handle(&request.email).await;

    (
        outcome.status,
        Json(MessageResponse {
            message: outcome.message,
        }),
    )
}
