//! Publish loop with statum state machine
//!
//! ```text
//! Armed ──start──► Ticking ──cancel / outbound closed──► Finished
//! ```
//!
//! The first tick fires one full interval after `start`. Cancellation is checked
//! before every tick and before every target, so once the token is cancelled no
//! further snapshot is read or sent.

use super::PublisherSettings;
use crate::mqtt::message_manager::MqttMessage;
use crate::store::DeviceStore;
use crate::topic::TopicScheme;
use serde_json::Value;
use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[state]
#[derive(Debug, Clone)]
pub enum LoopState {
    Armed,
    Ticking,
    Finished,
}

#[machine]
pub struct PublishLoop<S: LoopState> {
    store: Arc<DeviceStore>,
    topics: TopicScheme,
    outbound: mpsc::Sender<MqttMessage>,
    settings: PublisherSettings,
    cancel: CancellationToken,
    ticks: u64,
    published: u64,
}

impl<S: LoopState> PublishLoop<S> {
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl PublishLoop<Armed> {
    pub fn create(
        store: Arc<DeviceStore>,
        topics: TopicScheme,
        outbound: mpsc::Sender<MqttMessage>,
        settings: PublisherSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(store, topics, outbound, settings, cancel, 0, 0)
    }

    pub fn start(self) -> PublishLoop<Ticking> {
        info!(
            "Timed publishing every {:?} to {} targets on {}",
            self.settings.interval,
            self.settings.targets.len(),
            self.settings.kind
        );
        self.transition()
    }
}

impl PublishLoop<Ticking> {
    pub async fn run(mut self) -> PublishLoop<Finished> {
        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Publish loop cancelled after {} ticks", self.ticks);
                    break;
                }
                _ = ticker.tick() => {
                    if !self.publish_tick().await {
                        break;
                    }
                }
            }
        }

        info!(
            "Timed publishing stopped after {} ticks, {} publications",
            self.ticks, self.published
        );
        self.transition()
    }

    /// Publishes one snapshot per target. Returns false when the loop must end.
    async fn publish_tick(&mut self) -> bool {
        self.ticks += 1;

        for scope in &self.settings.targets {
            if self.cancel.is_cancelled() {
                return false;
            }

            let snapshot = self.store.snapshot(scope).await;
            let msg = MqttMessage::from_topic(
                self.topics.topic_for(scope, self.settings.kind),
                Value::Object(snapshot),
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                sent = self.outbound.send(msg) => {
                    if sent.is_err() {
                        error!("Outbound queue closed, ending timed publishing");
                        return false;
                    }
                }
            }
            self.published += 1;
        }

        debug!("Tick {} published {} snapshots", self.ticks, self.settings.targets.len());
        true
    }
}
