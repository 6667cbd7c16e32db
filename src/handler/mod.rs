//! # Message Handlers
//!
//! Turns one inbound publication into zero or more outbound publications.
//!
//! ```text
//! topic + bytes ──► classify ──► decode JSON ──┬─ config  ──► ConfigMergeHandler
//!                                              └─ request ──► RequestLookupHandler
//! ```
//!
//! `response` and `act_value` topics are outputs of this gateway; if they come back in
//! (for example through a broad subscription) they are ignored rather than treated as
//! errors. Every failure is confined to the message that caused it.

pub mod config;
pub mod diagnostics;
pub mod request;

pub use config::{ConfigApplied, ConfigMergeHandler};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use request::{LookupAnswer, RequestLookupHandler};

use crate::mqtt::message_manager::MqttMessage;
use crate::store::DeviceStore;
use crate::topic::{classify, ClassificationError, MessageKind, TopicScheme};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Routes classified messages to the config and request handlers.
pub struct Dispatcher {
    config: ConfigMergeHandler,
    request: RequestLookupHandler,
    diagnostics: Arc<Diagnostics>,
}

impl Dispatcher {
    pub fn new(store: Arc<DeviceStore>, topics: TopicScheme) -> Self {
        let diagnostics = Arc::new(Diagnostics::default());
        Self {
            config: ConfigMergeHandler::new(store.clone(), topics.clone(), diagnostics.clone()),
            request: RequestLookupHandler::new(store, topics, diagnostics.clone()),
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        self.diagnostics.clone()
    }

    pub fn config_handler(&self) -> &ConfigMergeHandler {
        &self.config
    }

    pub fn request_handler(&self) -> &RequestLookupHandler {
        &self.request
    }

    /// Handles one publication. Errors are counted as dropped messages; the caller
    /// only needs to log them.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Vec<MqttMessage>, HandlerError> {
        let result = self.route(topic, payload).await;
        match &result {
            Ok(_) => self.diagnostics.record_handled(),
            Err(_) => self.diagnostics.record_dropped(),
        }
        result
    }

    async fn route(&self, topic: &str, payload: &[u8]) -> Result<Vec<MqttMessage>, HandlerError> {
        let descriptor = classify(topic)?;

        match descriptor.kind {
            MessageKind::Config => {
                let values = config::parse_config(decode(payload)?)?;
                let applied = self.config.apply_config(&descriptor, &values).await?;
                Ok(applied.outbound)
            }
            MessageKind::Request => {
                let names = request::parse_request(decode(payload)?)?;
                let answer = self.request.apply_request(&descriptor, &names).await;
                Ok(answer.outbound)
            }
            MessageKind::Response | MessageKind::ActValue => {
                debug!("Ignoring {} publication for {}", descriptor.kind, descriptor.scope);
                Ok(Vec::new())
            }
        }
    }
}

fn decode(payload: &[u8]) -> Result<Value, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| {
        warn!("Payload is not valid JSON: {}", e);
        ProtocolError::MalformedPayload(format!("invalid JSON: {}", e))
    })
}
