//! # Timed Publisher
//!
//! Periodically re-publishes record snapshots, independent of inbound traffic.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──stop()──► Stopped
//!    ▲                                        │
//!    └──────────────── toggle() ──────────────┘
//! ```
//!
//! At most one loop is active. The state is owned here and observed through a
//! `watch` channel; nothing outside this module flips it. `stop()` cancels the loop
//! and waits for it, so once it returns no further publication is emitted.
//!
//! Interval, targets and kind can only change while stopped. Changing them under a
//! running loop would race its sleep; stop, reconfigure, start instead.

pub mod publish_loop;

use crate::mqtt::message_manager::MqttMessage;
use crate::store::DeviceStore;
use crate::topic::{MessageKind, Scope, TopicScheme};
use publish_loop::PublishLoop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub interval: Duration,
    /// Empty means every known device tag, or core when no tag is known.
    pub targets: Vec<Scope>,
    pub kind: MessageKind,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            targets: Vec::new(),
            kind: MessageKind::ActValue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublisherError {
    #[error("Interval must be greater than zero")]
    InvalidInterval,

    #[error("Timed publishing can only publish response or act_value, not {0}")]
    UnsupportedKind(MessageKind),

    #[error("Settings cannot change while timed publishing is running")]
    ChangeWhileRunning,

    #[error("Timed publishing is already running")]
    AlreadyRunning,
}

struct ActiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

struct Control {
    settings: PublisherSettings,
    active: Option<ActiveLoop>,
}

pub struct TimedPublisher {
    store: Arc<DeviceStore>,
    topics: TopicScheme,
    outbound: mpsc::Sender<MqttMessage>,
    control: Mutex<Control>,
    state: Arc<watch::Sender<PublisherState>>,
}

impl TimedPublisher {
    pub fn new(
        store: Arc<DeviceStore>,
        topics: TopicScheme,
        outbound: mpsc::Sender<MqttMessage>,
        settings: PublisherSettings,
    ) -> Result<Self, PublisherError> {
        validate(&settings)?;
        let (state, _) = watch::channel(PublisherState::Stopped);
        Ok(Self {
            store,
            topics,
            outbound,
            control: Mutex::new(Control {
                settings,
                active: None,
            }),
            state: Arc::new(state),
        })
    }

    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    pub async fn settings(&self) -> PublisherSettings {
        self.control.lock().await.settings.clone()
    }

    pub async fn set_interval(&self, interval: Duration) -> Result<(), PublisherError> {
        self.update_settings(|settings| settings.interval = interval).await
    }

    pub async fn set_targets(&self, targets: Vec<Scope>) -> Result<(), PublisherError> {
        self.update_settings(|settings| settings.targets = targets).await
    }

    pub async fn set_kind(&self, kind: MessageKind) -> Result<(), PublisherError> {
        self.update_settings(|settings| settings.kind = kind).await
    }

    async fn update_settings(
        &self,
        change: impl FnOnce(&mut PublisherSettings),
    ) -> Result<(), PublisherError> {
        let mut control = self.control.lock().await;
        reap_finished(&mut control);
        if control.active.is_some() {
            return Err(PublisherError::ChangeWhileRunning);
        }

        let mut settings = control.settings.clone();
        change(&mut settings);
        validate(&settings)?;
        control.settings = settings;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), PublisherError> {
        let mut control = self.control.lock().await;
        reap_finished(&mut control);
        if control.active.is_some() {
            return Err(PublisherError::AlreadyRunning);
        }

        let mut settings = control.settings.clone();
        if settings.targets.is_empty() {
            settings.targets = self.default_targets().await;
        }

        let cancel = CancellationToken::new();
        let armed = PublishLoop::create(
            self.store.clone(),
            self.topics.clone(),
            self.outbound.clone(),
            settings,
            cancel.clone(),
        );

        // published before the spawn, so a loop that ends at once has the last word
        self.state.send_replace(PublisherState::Running);
        let state = self.state.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let finished = armed.start().run().await;
            // a loop that ended on its own (closed queue) must not stay reported as running
            if !loop_cancel.is_cancelled() {
                state.send_replace(PublisherState::Stopped);
            }
            finished.published()
        });

        control.active = Some(ActiveLoop { cancel, handle });
        info!("Timed publishing is now ON");
        Ok(())
    }

    /// Stops the loop and waits for it. Returns the number of publications the loop
    /// made, or `None` if nothing was running.
    pub async fn stop(&self) -> Option<u64> {
        let mut control = self.control.lock().await;
        let active = control.active.take()?;

        active.cancel.cancel();
        let published = match active.handle.await {
            Ok(published) => published,
            Err(e) => {
                warn!("Publish loop ended abnormally: {}", e);
                0
            }
        };

        self.state.send_replace(PublisherState::Stopped);
        info!("Timed publishing is now OFF");
        Some(published)
    }

    /// Starts when stopped, stops when running. Returns the new state.
    pub async fn toggle(&self) -> Result<PublisherState, PublisherError> {
        if self.state() == PublisherState::Running && self.stop().await.is_some() {
            return Ok(PublisherState::Stopped);
        }
        self.start().await?;
        Ok(PublisherState::Running)
    }

    async fn default_targets(&self) -> Vec<Scope> {
        let tags: Vec<Scope> = self
            .store
            .scopes()
            .await
            .into_iter()
            .filter(|scope| matches!(scope, Scope::Device(_)))
            .collect();

        if tags.is_empty() {
            debug!("No device tags known, timed publishing targets core");
            vec![Scope::Core]
        } else {
            tags
        }
    }
}

fn validate(settings: &PublisherSettings) -> Result<(), PublisherError> {
    if settings.interval.is_zero() {
        return Err(PublisherError::InvalidInterval);
    }
    match settings.kind {
        MessageKind::Response | MessageKind::ActValue => Ok(()),
        other => Err(PublisherError::UnsupportedKind(other)),
    }
}

fn reap_finished(control: &mut Control) {
    if control
        .active
        .as_ref()
        .is_some_and(|active| active.handle.is_finished())
    {
        debug!("Reaping publish loop that ended on its own");
        control.active = None;
    }
}
