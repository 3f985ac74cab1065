//! Component K — Notification Dispatcher (spec §4.K).
//!
//! Fire-and-forget from the orchestrator's perspective: every
//! implementation's errors are logged, never surfaced to the caller. The
//! orchestrator dispatches via `tokio::spawn` so cancellation of the
//! inbound request never cancels an in-flight notification (spec §5).

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub kind: String,
    pub requester: String,
    pub profile: String,
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), String>;
}

pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, _event: &NotificationEvent) -> Result<(), String> {
        Ok(())
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, max_attempts: u32) -> Self {
        WebhookSink {
            client: reqwest::Client::new(),
            url: url.into(),
            max_attempts,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self.client.post(&self.url).json(event).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_server_error() && attempt < self.max_attempts => {
                    let backoff_ms = 100u64 * 2u64.pow(attempt - 1);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                Ok(resp) => return Err(format!("webhook returned {}", resp.status())),
                Err(e) if attempt < self.max_attempts => {
                    let backoff_ms = 100u64 * 2u64.pow(attempt - 1);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

pub struct PubSubSink {
    topic: String,
}

impl PubSubSink {
    pub fn new(topic: impl Into<String>) -> Self {
        PubSubSink { topic: topic.into() }
    }
}

#[async_trait]
impl NotificationSink for PubSubSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), String> {
        tracing::info!(topic = %self.topic, kind = %event.kind, "publishing notification");
        Ok(())
    }
}

/// Fan-out with error aggregation: every sink is invoked; the first
/// caller-visible error (if any) aggregates every sink's failure message.
pub struct MultiSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        MultiSink { sinks }
    }
}

#[async_trait]
impl NotificationSink for MultiSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), String> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}
