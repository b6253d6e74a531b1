// src/rabbitmq/message.rs
// Driver-neutral message properties and outbound publishings.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Serialize;

/// AMQP basic properties carried by publishings and deliveries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Application headers. `None` is normalized to an empty table on publish.
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the unix epoch.
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: MessageProperties::default(),
            body: body.into(),
        }
    }

    /// Serializes `value` as the body and marks the content type as JSON.
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        self.properties
            .headers
            .get_or_insert_with(FieldTable::default)
            .insert(ShortString::from(key.to_string()), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.properties.delivery_mode = Some(2);
        self
    }

    pub fn with_timestamp_now(mut self) -> Self {
        self.properties.timestamp = Some(chrono::Utc::now().timestamp() as u64);
        self
    }

    /// Guarantees a header table is present; some brokers reject a null table.
    pub(crate) fn ensure_headers(&mut self) {
        if self.properties.headers.is_none() {
            self.properties.headers = Some(FieldTable::default());
        }
    }
}
