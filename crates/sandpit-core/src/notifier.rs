//! Webhook notifications for finished submissions

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::config::CallbackConfig;
use crate::errors::SandpitError;
use crate::submission::Submission;

pub const TOKEN_HEADER: &str = "X-Sandpit-Token";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a terminal submission to its callback. Called once per
    /// terminal transition; retrying is the notifier's business.
    async fn notify(&self, submission: &Submission) -> Result<(), SandpitError>;
}

pub struct WebhookNotifier {
    client: Client,
    config: CallbackConfig,
}

impl WebhookNotifier {
    pub fn new(config: CallbackConfig) -> Result<Self, SandpitError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(format!("sandpit/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SandpitError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.initial_backoff_ms.saturating_mul(factor))
    }

    async fn deliver(&self, url: &str, submission: &Submission) -> Result<(), String> {
        let response = self
            .client
            .put(url)
            .header(TOKEN_HEADER, &submission.token)
            .json(&submission.view())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, submission: &Submission) -> Result<(), SandpitError> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(url) = submission.callback_url.as_deref() else {
            return Ok(());
        };

        let max_tries = self.config.max_tries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_tries {
            log::info!(
                "Sending callback for {} to {} (attempt {}/{})",
                submission.token,
                url,
                attempt,
                max_tries
            );
            match self.deliver(url, submission).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Callback for {} failed: {}", submission.token, e);
                    last_error = e;
                }
            }
            if attempt < max_tries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        log::error!(
            "Giving up on callback for {} after {} attempts",
            submission.token,
            max_tries
        );
        Err(SandpitError::internal(format!(
            "callback to {} failed: {}",
            url, last_error
        )))
    }
}
