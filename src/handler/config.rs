//! Config messages: merge a partial update into the addressed record, then publish
//! the full snapshot on `act_value` and echo the update on `response`.

use super::diagnostics::Diagnostics;
use super::ProtocolError;
use crate::mqtt::message_manager::MqttMessage;
use crate::store::{DeviceStore, MergeReport, Values};
use crate::topic::{MessageKind, TopicDescriptor, TopicScheme};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigApplied {
    pub snapshot: Values,
    pub report: MergeReport,
    /// `act_value` snapshot first, then the `response` echo.
    pub outbound: Vec<MqttMessage>,
}

pub struct ConfigMergeHandler {
    store: Arc<DeviceStore>,
    topics: TopicScheme,
    diagnostics: Arc<Diagnostics>,
}

impl ConfigMergeHandler {
    pub fn new(store: Arc<DeviceStore>, topics: TopicScheme, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            store,
            topics,
            diagnostics,
        }
    }

    pub async fn apply_config(
        &self,
        descriptor: &TopicDescriptor,
        payload: &Values,
    ) -> Result<ConfigApplied, ProtocolError> {
        ensure_scalars(payload)?;
        let scope = &descriptor.scope;

        let outcome = self.store.merge(scope, payload).await;
        if outcome.persisted.is_err() {
            self.diagnostics.record_store_failure();
        }
        if !outcome.report.rejected.is_empty() {
            self.diagnostics.record_rejected_keys(outcome.report.rejected.len());
        }

        info!(
            "Config for {}: {} updated, {} inserted, {} rejected",
            scope,
            outcome.report.updated.len(),
            outcome.report.inserted.len(),
            outcome.report.rejected.len()
        );

        let outbound = vec![
            MqttMessage::from_topic(
                self.topics.topic_for(scope, MessageKind::ActValue),
                Value::Object(outcome.snapshot.clone()),
            ),
            MqttMessage::from_topic(
                self.topics.topic_for(scope, MessageKind::Response),
                Value::Object(payload.clone()),
            ),
        ];
        debug!("Config for {} produced {} publications", scope, outbound.len());

        Ok(ConfigApplied {
            snapshot: outcome.snapshot,
            report: outcome.report,
            outbound,
        })
    }
}

/// Accepts a decoded JSON value as a config payload.
pub fn parse_config(payload: Value) -> Result<Values, ProtocolError> {
    match payload {
        Value::Object(values) => {
            ensure_scalars(&values)?;
            Ok(values)
        }
        other => Err(ProtocolError::MalformedPayload(format!(
            "config must be a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn ensure_scalars(values: &Values) -> Result<(), ProtocolError> {
    for (key, value) in values {
        if value.is_array() || value.is_object() {
            return Err(ProtocolError::MalformedPayload(format!(
                "value for {:?} must be a string, number, bool or null, got {}",
                key,
                json_type(value)
            )));
        }
    }
    Ok(())
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
