use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// Raw inbound message: a type tag plus free-form fields
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// A message wrapped with submitter identity, timestamp and a generated id
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageEvent {
    pub id: String,
    pub payload: MessagePayload,
    pub submitter_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced synchronously by the event manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("Message queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Event manager is not running")]
    NotRunning,

    #[error("Invalid message payload: {0}")]
    InvalidPayload(String),
}

/// Handler invoked for every message of the type it is registered for
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: MessageEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: MessageEvent) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a message handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

impl MessagePayload {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Parse a JSON object carrying a string `"type"` field
    pub fn from_value(value: serde_json::Value) -> Result<Self, EventError> {
        let serde_json::Value::Object(mut data) = value else {
            return Err(EventError::InvalidPayload(
                "message must be a JSON object".to_string(),
            ));
        };

        let message_type = match data.remove("type") {
            Some(serde_json::Value::String(tag)) if !tag.trim().is_empty() => tag,
            Some(_) => {
                return Err(EventError::InvalidPayload(
                    "\"type\" must be a non-empty string".to_string(),
                ));
            }
            None => {
                return Err(EventError::InvalidPayload(
                    "missing \"type\" field".to_string(),
                ));
            }
        };

        Ok(Self { message_type, data })
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// The payload as a single JSON object, type tag included
    pub fn to_value(&self) -> serde_json::Value {
        let mut object = self.data.clone();
        object.insert(
            "type".to_string(),
            serde_json::Value::String(self.message_type.clone()),
        );
        serde_json::Value::Object(object)
    }
}

impl MessageEvent {
    pub fn new(payload: MessagePayload, submitter_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            submitter_id: submitter_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.payload.message_type
    }
}
