use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

/// Summary handed to the notifier when an abnormal capture clears the
/// per-device cooldown.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub device_id: String,
    pub device_name: String,
    pub capture_id: String,
    pub score: f64,
    pub reason: String,
}

/// Fire-and-forget alert delivery. Rate limiting is the evaluator's job
/// (cooldown claim), not the notifier's.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &CaptureSummary) -> Result<()>;
}

/// POSTs the capture summary as JSON to a configured webhook URL.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &CaptureSummary) -> Result<()> {
        let res = self.client.post(&self.url).json(summary).send().await?;
        res.error_for_status()?;
        Ok(())
    }
}

/// Used when no webhook is configured: the alert only reaches the logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &CaptureSummary) -> Result<()> {
        info!(
            "Abnormal capture on [{}] ({}): {} (score {:.2})",
            summary.device_name, summary.capture_id, summary.reason, summary.score
        );
        Ok(())
    }
}
