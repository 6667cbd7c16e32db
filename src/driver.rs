//! # Traffic Driver
//!
//! Publishes `config` and `request` payloads toward a gateway, the way a test bench or
//! fleet operator does. Targets are the core device, one tag, an inclusive tag range
//! or every known tag.
//!
//! ```text
//! payloads ──► plan(): one round per payload, one message per target ──► publish_rounds()
//! ```
//!
//! A payload file looks like `{"payloads": [{...}, {...}]}`. With `echo_response`, every
//! config message is followed by a copy on the target's `response` topic with null
//! values left out.

use crate::handler::{config, request, ProtocolError};
use crate::mqtt::config::MqttConfig;
use crate::mqtt::message_manager::MqttMessage;
use crate::provisioning;
use crate::topic::{ClassificationError, MessageKind, Scope, TopicScheme};
use rumqttc::{AsyncClient, Event, Outgoing, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Range must look like FROM-TO, got {0:?}")]
    InvalidRange(String),

    #[error("No known tag matches the selection")]
    NoTargets,

    #[error("Invalid target: {0}")]
    Target(#[from] ClassificationError),

    #[error("Only config and request can be sent to a gateway, not {0}")]
    UnsupportedKind(MessageKind),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error(transparent)]
    Payload(#[from] ProtocolError),

    #[error("Payload file {path}: {reason}")]
    PayloadFile { path: String, reason: String },

    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection failed: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Core,
    Tag(String),
    /// Inclusive, compared as strings against the known tags.
    Range { from: String, to: String },
    All,
}

impl Target {
    /// Parses `FROM-TO`.
    pub fn range(text: &str) -> Result<Self, DriverError> {
        match text.trim().split_once('-') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => Ok(Target::Range {
                from: from.trim().to_string(),
                to: to.trim().to_string(),
            }),
            _ => Err(DriverError::InvalidRange(text.to_string())),
        }
    }

    /// Scopes to publish to, given the known tag universe.
    pub fn resolve(&self, known: &[String]) -> Result<Vec<Scope>, DriverError> {
        let scopes: Vec<Scope> = match self {
            Target::Core => vec![Scope::Core],
            Target::Tag(tag) => vec![tag.parse::<Scope>()?],
            Target::Range { from, to } => provisioning::select_range(known, from, to)
                .into_iter()
                .map(Scope::Device)
                .collect(),
            Target::All => known.iter().map(Scope::device).collect(),
        };

        if scopes.is_empty() {
            return Err(DriverError::NoTargets);
        }
        Ok(scopes)
    }
}

fn ensure_sendable(kind: MessageKind) -> Result<(), DriverError> {
    match kind {
        MessageKind::Config | MessageKind::Request => Ok(()),
        other => Err(DriverError::UnsupportedKind(other)),
    }
}

/// Checks a payload against what the gateway accepts for `kind`.
pub fn validate_payload(kind: MessageKind, payload: &Value) -> Result<(), DriverError> {
    ensure_sendable(kind)?;
    match kind {
        MessageKind::Request => {
            request::parse_request(payload.clone())?;
        }
        _ => {
            config::parse_config(payload.clone())?;
        }
    }
    Ok(())
}

pub fn parse_payload(kind: MessageKind, raw: &str) -> Result<Value, DriverError> {
    let payload: Value = serde_json::from_str(raw).map_err(|e| DriverError::InvalidJson(e.to_string()))?;
    validate_payload(kind, &payload)?;
    Ok(payload)
}

#[derive(Deserialize, Debug, Default)]
struct PayloadFile {
    #[serde(default)]
    payloads: Vec<Value>,
}

/// Reads `{"payloads": [...]}` and validates every entry for `kind`.
pub async fn load_payload_file(path: &Path, kind: MessageKind) -> Result<Vec<Value>, DriverError> {
    let file_error = |reason: String| DriverError::PayloadFile {
        path: path.display().to_string(),
        reason,
    };

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| file_error(e.to_string()))?;
    let file: PayloadFile = serde_json::from_str(&content).map_err(|e| file_error(e.to_string()))?;
    if file.payloads.is_empty() {
        return Err(file_error("no payloads".to_string()));
    }

    for payload in &file.payloads {
        validate_payload(kind, payload)?;
    }
    info!("Loaded {} payloads from {}", file.payloads.len(), path.display());
    Ok(file.payloads)
}

/// One round per payload, each round addressing every target in order.
pub fn plan(
    topics: &TopicScheme,
    targets: &[Scope],
    kind: MessageKind,
    payloads: &[Value],
    echo_response: bool,
) -> Vec<Vec<MqttMessage>> {
    payloads
        .iter()
        .map(|payload| {
            let echo = match payload {
                Value::Object(values) if echo_response && kind == MessageKind::Config => Some(Value::Object(
                    values
                        .iter()
                        .filter(|(_, value)| !value.is_null())
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect(),
                )),
                _ => None,
            };

            let mut round = Vec::new();
            for scope in targets {
                round.push(MqttMessage::from_topic(topics.topic_for(scope, kind), payload.clone()));
                if let Some(echo) = &echo {
                    round.push(MqttMessage::from_topic(
                        topics.topic_for(scope, MessageKind::Response),
                        echo.clone(),
                    ));
                }
            }
            round
        })
        .collect()
}

/// Connects with its own client id, publishes every round with `pace` between rounds,
/// then disconnects cleanly. Returns the number of messages handed to the broker.
pub async fn publish_rounds(
    config: &MqttConfig,
    rounds: Vec<Vec<MqttMessage>>,
    pace: Duration,
) -> Result<usize, DriverError> {
    let client_id = format!("{}-driver", config.client_id);
    let (client, mut eventloop) = AsyncClient::new(config.options_for(&client_id), config.channel_capacity.max(1));

    let sender = tokio::spawn(async move {
        let total = rounds.len();
        let mut sent = 0;
        for (index, round) in rounds.into_iter().enumerate() {
            for msg in round {
                client
                    .publish(msg.topic.as_str(), QoS::AtMostOnce, false, msg.encode())
                    .await?;
                debug!("Published to {}: {}", msg.topic, msg.payload);
                sent += 1;
            }
            if index + 1 < total {
                tokio::time::sleep(pace).await;
            }
        }
        client.disconnect().await?;
        Ok::<usize, DriverError>(sent)
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Driver connected to {}:{}", config.host, config.port),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                sender.abort();
                return Err(DriverError::Connection(e.to_string()));
            }
        }
    }

    let sent = sender
        .await
        .map_err(|e| DriverError::Connection(format!("publisher task failed: {}", e)))??;
    info!("Published {} messages", sent);
    Ok(sent)
}
