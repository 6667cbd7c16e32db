use chrono::NaiveDateTime;
use serde_json::Value;
use std::fmt;

/// Outbound publication produced by the gateway core.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Value,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}: {}", self.timestamp, self.topic, self.payload)
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, payload: Value) -> Self {
        MqttMessage {
            topic,
            payload,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Compact JSON encoding used on the wire.
    pub fn encode(&self) -> Vec<u8> {
        self.payload.to_string().into_bytes()
    }

    pub fn render(&self) -> String {
        let pretty =
            serde_json::to_string_pretty(&self.payload).unwrap_or_else(|_| self.payload.to_string());
        format!("{}: {}\n{}", self.timestamp, self.topic, pretty)
    }
}

/// Raw publication received from the broker, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: NaiveDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Payload as text for logging; invalid UTF-8 is replaced, not rejected.
    pub fn preview(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
