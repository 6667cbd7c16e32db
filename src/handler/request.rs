use super::config::json_type;
use super::diagnostics::Diagnostics;
use super::ProtocolError;
use crate::mqtt::message_manager::MqttMessage;
use crate::store::{DeviceStore, Values};
use crate::topic::{MessageKind, TopicDescriptor, TopicScheme};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct LookupAnswer {
    /// Only variables present in the record; misses are left out.
    pub response: Values,
    /// One `response` publication, or none when nothing matched.
    pub outbound: Vec<MqttMessage>,
}

pub struct RequestLookupHandler {
    store: Arc<DeviceStore>,
    topics: TopicScheme,
    diagnostics: Arc<Diagnostics>,
}

impl RequestLookupHandler {
    pub fn new(store: Arc<DeviceStore>, topics: TopicScheme, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            store,
            topics,
            diagnostics,
        }
    }

    pub async fn apply_request(&self, descriptor: &TopicDescriptor, names: &[String]) -> LookupAnswer {
        let scope = &descriptor.scope;
        let snapshot = self.store.snapshot(scope).await;

        let mut response = Values::new();
        for name in names {
            match snapshot.get(name) {
                Some(value) => {
                    response.insert(name.clone(), value.clone());
                }
                None => {
                    debug!("Lookup miss for {:?} on {}", name, scope);
                    self.diagnostics.record_lookup_miss();
                }
            }
        }

        if response.is_empty() {
            info!("No matching variables for request on {}", scope);
            return LookupAnswer {
                response,
                outbound: Vec::new(),
            };
        }

        let outbound = vec![MqttMessage::from_topic(
            self.topics.topic_for(scope, MessageKind::Response),
            Value::Object(response.clone()),
        )];
        LookupAnswer { response, outbound }
    }
}

/// Accepts a decoded JSON value as a request payload: an array of variable names.
pub fn parse_request(payload: Value) -> Result<Vec<String>, ProtocolError> {
    let items = match payload {
        Value::Array(items) => items,
        other => {
            return Err(ProtocolError::MalformedRequest(format!(
                "request must be a JSON array, got {}",
                json_type(&other)
            )))
        }
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::String(name) => Ok(name),
            other => Err(ProtocolError::MalformedRequest(format!(
                "variable names must be strings, got {}",
                json_type(&other)
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::{classify, Scope};
    use serde_json::json;

    async fn handler_with(record: Value) -> (RequestLookupHandler, Arc<Diagnostics>) {
        let store = Arc::new(DeviceStore::in_memory());
        store
            .set(&Scope::device("TAGA"), record.as_object().cloned().unwrap())
            .await
            .unwrap();
        let diagnostics = Arc::new(Diagnostics::default());
        (
            RequestLookupHandler::new(store, TopicScheme::new("gw"), diagnostics.clone()),
            diagnostics,
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn misses_are_counted_not_returned() {
        let (handler, diagnostics) = handler_with(json!({"Interval": 30})).await;
        let descriptor = classify("gw/lightpost/TAGA/request").unwrap();

        let answer = handler
            .apply_request(&descriptor, &names(&["Interval", "Missing"]))
            .await;

        assert_eq!(Value::Object(answer.response), json!({"Interval": 30}));
        assert_eq!(answer.outbound.len(), 1);
        assert_eq!(answer.outbound[0].topic, "gw/lightpost/TAGA/response");
        assert_eq!(answer.outbound[0].payload, json!({"Interval": 30}));
        assert_eq!(diagnostics.snapshot().lookup_misses, 1);
    }

    #[tokio::test]
    async fn all_miss_request_publishes_nothing() {
        let (handler, diagnostics) = handler_with(json!({"Interval": 30})).await;
        let descriptor = classify("gw/lightpost/TAGA/request").unwrap();

        let answer = handler
            .apply_request(&descriptor, &names(&["Nope", "AlsoNope"]))
            .await;

        assert!(answer.response.is_empty());
        assert!(answer.outbound.is_empty());
        assert_eq!(diagnostics.snapshot().lookup_misses, 2);
    }

    #[tokio::test]
    async fn empty_request_is_a_no_op() {
        let (handler, diagnostics) = handler_with(json!({"Interval": 30})).await;
        let answer = handler
            .apply_request(&classify("gw/lightpost/TAGA/request").unwrap(), &[])
            .await;
        assert!(answer.outbound.is_empty());
        assert_eq!(diagnostics.snapshot().lookup_misses, 0);
    }

    #[tokio::test]
    async fn duplicates_collapse_into_one_entry() {
        let (handler, _) = handler_with(json!({"Interval": 30, "LightPower": 10})).await;
        let answer = handler
            .apply_request(
                &classify("gw/lightpost/TAGA/request").unwrap(),
                &names(&["LightPower", "Interval", "LightPower"]),
            )
            .await;
        assert_eq!(
            Value::Object(answer.response),
            json!({"Interval": 30, "LightPower": 10})
        );
    }

    #[test]
    fn parse_request_requires_array_of_strings() {
        assert_eq!(
            parse_request(json!(["Interval", "Latitude"])).unwrap(),
            names(&["Interval", "Latitude"])
        );
        assert!(matches!(
            parse_request(json!({"Interval": 1})),
            Err(ProtocolError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(json!(["Interval", 3])),
            Err(ProtocolError::MalformedRequest(_))
        ));
    }
}
