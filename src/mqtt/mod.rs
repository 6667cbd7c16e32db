//! # MQTT Transport Bridge
//!
//! Connects the gateway core to a broker. The core never talks to rumqttc directly: it
//! consumes [`InboundMessage`]s from one channel and produces [`MqttMessage`]s on
//! another, and this module moves bytes between those channels and the broker.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings
//! ├── message_manager.rs  - Inbound/outbound message representation
//! └── mqtt_handler.rs     - Event loop, subscriptions and publishing
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! broker ──Publish──► MqttHandler ──InboundMessage──► dispatch loop
//!                                                        │
//! broker ◄──publish── MqttHandler ◄──MqttMessage────────┘ (and TimedPublisher)
//! ```
//!
//! Outbound messages go out at QoS 0 from their own task, which waits for room in the
//! client's request queue instead of dropping. Inbound publications the dispatch loop
//! has not taken yet wait in a backlog so the event loop is never starved.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
