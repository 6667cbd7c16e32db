//! # Gateway Service
//!
//! Wires the core together around two channels:
//!
//! ```text
//! inbound mpsc ──► dispatch loop ──► Dispatcher ──┐
//!                                                 ├──► outbound mpsc ──► transport
//!                  TimedPublisher ────────────────┘
//! ```
//!
//! The dispatch loop is the only consumer of the inbound queue, so messages are
//! handled one at a time in arrival order. The publisher runs in its own task and
//! shares the store through `Arc`.

use crate::handler::{Diagnostics, Dispatcher};
use crate::mqtt::message_manager::{InboundMessage, MqttMessage};
use crate::publisher::{PublisherError, PublisherSettings, TimedPublisher};
use crate::store::DeviceStore;
use crate::topic::{MessageKind, Scope, TopicScheme};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Gateway {
    store: Arc<DeviceStore>,
    topics: TopicScheme,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<TimedPublisher>,
    outbound: mpsc::Sender<MqttMessage>,
}

impl Gateway {
    pub fn new(
        store: Arc<DeviceStore>,
        topics: TopicScheme,
        outbound: mpsc::Sender<MqttMessage>,
        publisher_settings: PublisherSettings,
    ) -> Result<Self, PublisherError> {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), topics.clone()));
        let publisher = Arc::new(TimedPublisher::new(
            store.clone(),
            topics.clone(),
            outbound.clone(),
            publisher_settings,
        )?);

        Ok(Self {
            store,
            topics,
            dispatcher,
            publisher,
            outbound,
        })
    }

    pub fn store(&self) -> Arc<DeviceStore> {
        self.store.clone()
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    pub fn publisher(&self) -> Arc<TimedPublisher> {
        self.publisher.clone()
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        self.dispatcher.diagnostics()
    }

    /// Publishes the core snapshot on `act_value`, as the device does after connecting.
    pub async fn announce(&self) {
        let snapshot = self.store.snapshot(&Scope::Core).await;
        let msg = MqttMessage::from_topic(
            self.topics.topic_for(&Scope::Core, MessageKind::ActValue),
            Value::Object(snapshot),
        );
        if self.outbound.send(msg).await.is_err() {
            warn!("Outbound queue closed, startup act_value not published");
        } else {
            info!("Published core act_value on startup");
        }
    }

    /// Spawns the single-consumer dispatch loop.
    pub fn spawn_dispatch(
        &self,
        inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(run_dispatch_loop(dispatcher, inbound, outbound, shutdown))
    }
}

/// Handles inbound messages until the queue closes or `shutdown` fires. A failing
/// message is logged and skipped; it never ends the loop.
pub async fn run_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    outbound: mpsc::Sender<MqttMessage>,
    shutdown: CancellationToken,
) {
    info!("Dispatch loop started");

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        debug!("Message received from {}: {}", msg.topic, msg.preview());
        match dispatcher.dispatch(&msg.topic, &msg.payload).await {
            Ok(replies) => {
                for reply in replies {
                    if outbound.send(reply).await.is_err() {
                        warn!("Outbound queue closed, ending dispatch loop");
                        return;
                    }
                }
            }
            Err(e) => warn!("Dropped message on {}: {}", msg.topic, e),
        }
    }

    let stats = dispatcher.diagnostics().snapshot();
    info!(
        "Dispatch loop stopped: {} handled, {} dropped, {} lookup misses",
        stats.handled, stats.dropped, stats.lookup_misses
    );
}
