//! Notification side effect run by the worker for each contact request.
//!
//! The worker does not send email itself. It hands the address to a
//! [`Notifier`], which either just records the request in the logs or calls a
//! downstream webhook that owns delivery.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;
use url::Url;

/// Downstream action triggered by a consumed contact request.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, email: &str) -> Result<()>;
}

/// Logs the request and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, email: &str) -> Result<()> {
        info!(email = %email, "contact_request_received");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    email: &'a str,
}

/// POSTs `{"email": ...}` to a downstream endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, email: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&WebhookPayload { email })
            .send()
            .await
            .with_context(|| format!("Notification request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Notification endpoint {} returned {}", self.url, status);
        }

        info!(
            email = %email,
            url = %self.url,
            status_code = status.as_u16(),
            "notification_delivered"
        );
        Ok(())
    }
}
