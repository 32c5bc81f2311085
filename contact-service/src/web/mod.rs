//! Web server module for contact request intake.
//!
//! A thin HTTP surface over [`IntakeService`](crate::intake::IntakeService):
//! - `POST /email` runs the intake pipeline
//! - `GET /email` returns usage text
//! - `GET /health` for liveness probes

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{email_usage, health, submit_email, AppState, EmailRequest, MessageResponse};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/email", get(email_usage).post(submit_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
