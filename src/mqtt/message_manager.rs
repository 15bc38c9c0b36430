use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::error::BrokerError;

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            preview
        )
    }
}

impl InboundMessage {
    /// Payloads are decoded lossily; devices are expected to send UTF-8
    pub fn from_bytes(topic: String, payload: &[u8]) -> Self {
        InboundMessage {
            topic,
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at: Local::now(),
        }
    }
}

/// Outbound payload: raw text goes out unchanged, structured values as JSON
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Raw(String),
    Structured(Value),
}

impl Message {
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, BrokerError> {
        serde_json::to_value(value)
            .map(Message::Structured)
            .map_err(|e| BrokerError::Encode(e.to_string()))
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, BrokerError> {
        match self {
            Message::Raw(text) => Ok(text.into_bytes()),
            Message::Structured(value) => {
                serde_json::to_vec(&value).map_err(|e| BrokerError::Encode(e.to_string()))
            }
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Raw(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Raw(text)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Structured(value)
    }
}
