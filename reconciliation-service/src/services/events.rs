//! Asynchronous event publication.
//!
//! Events are published after the database transaction commits and never
//! influence the outcome of the request that produced them.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::observability::TracedClientExt;
use service_core::retry::{is_retryable_status, retry_call, RetryConfig, Retryable};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::services::metrics::record_event_published;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transient broker error with status {0}")]
    Unavailable(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid broker response: {0}")]
    InvalidResponse(String),
}

impl Retryable for PublishError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Network(_))
    }
}

/// Publish interface: `publish(topic, message) -> message_id`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        message: &serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<String, PublishError>;
}

/// Payload of the "transactions imported" event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsImported {
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub source: String,
    pub transaction_ids: Vec<Uuid>,
    pub imported_at: DateTime<Utc>,
}

/// Payload of the "transactions matched" alert event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsMatched {
    pub tenant_id: Uuid,
    pub matched_by: String,
    pub match_ids: Vec<Uuid>,
    pub transaction_ids: Vec<Uuid>,
    pub invoice_ids: Vec<Uuid>,
    pub paid_invoice_ids: Vec<Uuid>,
    pub matched_at: DateTime<Utc>,
}

/// Topic names used by the service.
#[derive(Debug, Clone)]
pub struct EventTopics {
    pub transactions_imported: String,
    pub transactions_matched: String,
}

/// Publish in the background; failures are logged and counted only.
pub fn spawn_publish<T: Serialize>(
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    event: &T,
    request_id: Option<String>,
) -> Option<JoinHandle<()>> {
    let message = match serde_json::to_value(event) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to serialize event");
            record_event_published(&topic, "error");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        match publisher
            .publish(&topic, &message, request_id.as_deref())
            .await
        {
            Ok(message_id) => {
                tracing::info!(topic = %topic, message_id = %message_id, "Event published");
                record_event_published(&topic, "ok");
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Event publication failed");
                record_event_published(&topic, "error");
            }
        }
    }))
}

// ============================================================================
// Google Pub/Sub (REST)
// ============================================================================

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub endpoint: String,
    pub project_id: String,
    pub access_token: Option<Secret<String>>,
    pub timeout: Duration,
}

/// Publishes through the Pub/Sub REST `topics.publish` method.
pub struct PubSubPublisher {
    client: reqwest::Client,
    config: PubSubConfig,
    retry: RetryConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_ids: Vec<String>,
}

impl PubSubPublisher {
    pub fn new(config: PubSubConfig, retry: RetryConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!(
            "{}/v1/projects/{}/topics/{}:publish",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id,
            topic
        )
    }

    async fn publish_once(
        &self,
        url: &str,
        body: &serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<String, PublishError> {
        let mut request = self.client.traced_post(url).json(body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send(request_id)
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if is_retryable_status(status) {
                return Err(PublishError::Unavailable(status.as_u16()));
            }
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

        parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::InvalidResponse("no message id returned".to_string()))
    }
}

/// Build the `topics.publish` request body for one JSON message.
fn publish_body(message: &serde_json::Value, request_id: Option<&str>) -> serde_json::Value {
    let data = STANDARD.encode(message.to_string());
    let mut attributes = serde_json::Map::new();
    if let Some(id) = request_id {
        attributes.insert("requestId".to_string(), json!(id));
    }
    json!({
        "messages": [{
            "data": data,
            "attributes": attributes,
        }]
    })
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(
        &self,
        topic: &str,
        message: &serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<String, PublishError> {
        let url = self.topic_url(topic);
        let body = publish_body(message, request_id);

        retry_call(&self.retry, "pubsub_publish", || {
            self.publish_once(&url, &body, request_id)
        })
        .await
    }
}

// ============================================================================
// Log-only publisher
// ============================================================================

/// Used when no broker is configured: events are only logged.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(
        &self,
        topic: &str,
        message: &serde_json::Value,
        _request_id: Option<&str>,
    ) -> Result<String, PublishError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(topic = %topic, message_id = %message_id, message = %message, "Event (no broker configured)");
        Ok(message_id)
    }
}

// ============================================================================
// In-memory publisher
// ============================================================================

/// Keeps published events in memory; optionally fails every call.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, serde_json::Value)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        message: &serde_json::Value,
        _request_id: Option<&str>,
    ) -> Result<String, PublishError> {
        if self.fail {
            return Err(PublishError::Unavailable(503));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push((topic.to_string(), message.clone()));
        }
        Ok(Uuid::new_v4().to_string())
    }
}
