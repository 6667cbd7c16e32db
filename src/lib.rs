//! Lightpost fleet simulator.
//!
//! Simulates lightpost devices behind one MQTT gateway. Inbound `config` and `request`
//! publications for the core device or a tagged lightpost are routed to per-device
//! records, and the results are published back on `act_value` and `response`.
//!
//! ```text
//! topic ──► topic::classify ──► handler::Dispatcher ──► store::DeviceStore
//!                                      │                       ▲
//!                                      ▼                       │
//!                              outbound publications ◄── publisher::TimedPublisher
//! ```

pub mod config;
pub mod driver;
pub mod handler;
pub mod mqtt;
pub mod provisioning;
pub mod publisher;
pub mod service;
pub mod store;
pub mod topic;
