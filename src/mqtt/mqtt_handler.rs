use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{InboundMessage, MqttMessage};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_KEPT_ERRORS: usize = 16;
const BACKLOG_WARN_STEP: usize = 1000;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Inbound queue closed")]
    InboundClosed,
}

/// Owns the rumqttc client and event loop for the lifetime of the service.
pub struct MqttHandler {
    client: AsyncClient,
    eventloop: EventLoop,
    filters: Vec<String>,
    status: Arc<watch::Sender<MqttStatus>>,
}

impl MqttHandler {
    /// `filters` are (re)subscribed on every ConnAck, so a broker restart does not
    /// leave the gateway deaf.
    pub fn new(config: &MqttConfig, filters: Vec<String>) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), config.channel_capacity.max(1));
        let (status, _) = watch::channel(MqttStatus::default());

        info!(
            "MQTT client {} prepared for {}:{}",
            config.client_id, config.host, config.port
        );

        MqttHandler {
            client,
            eventloop,
            filters,
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> watch::Receiver<MqttStatus> {
        self.status.subscribe()
    }

    /// Drives the connection until `shutdown` fires or the inbound queue closes.
    ///
    /// Outbound messages are published from a separate task that waits for room in the
    /// client's request queue, so a burst slows the dispatcher down instead of losing
    /// replies. The event loop keeps being polled while inbound publications wait for
    /// the dispatcher; they are held in a local backlog meanwhile.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<InboundMessage>,
        outbound: mpsc::Receiver<MqttMessage>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);

        let publisher_stop = shutdown.child_token();
        let publisher = tokio::spawn(publish_outbound(
            self.client.clone(),
            outbound,
            self.status.clone(),
            publisher_stop.clone(),
        ));

        let result = self.drive(inbound, &shutdown).await;

        publisher_stop.cancel();
        if let Err(e) = publisher.await {
            warn!("Outbound publisher ended abnormally: {}", e);
        }
        result
    }

    async fn drive(
        &mut self,
        inbound: mpsc::Sender<InboundMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut backlog: VecDeque<InboundMessage> = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("MQTT bridge shutting down");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("Disconnect request not queued: {}", e);
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                permit = inbound.reserve(), if !backlog.is_empty() => {
                    let permit = permit.map_err(|_| {
                        error!("Inbound queue closed, stopping MQTT bridge");
                        TransportError::InboundClosed
                    })?;
                    if let Some(msg) = backlog.pop_front() {
                        permit.send(msg);
                    }
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to broker");
                            self.set_state(ConnectionState::Connected);
                            self.subscribe_all()?;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            debug!("Received publication on {}", publish.topic);
                            self.status.send_modify(|s| {
                                s.messages_received += 1;
                                s.last_activity = Some(chrono::Local::now());
                            });
                            backlog.push_back(InboundMessage::new(publish.topic, publish.payload.to_vec()));
                            if backlog.len() % BACKLOG_WARN_STEP == 0 {
                                warn!("{} inbound publications waiting for the dispatcher", backlog.len());
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT connection error: {}", e);
                            self.status.send_modify(|s| {
                                s.connection_state = ConnectionState::Reconnecting;
                                s.error_messages.push(e.to_string());
                                if s.error_messages.len() > MAX_KEPT_ERRORS {
                                    s.error_messages.remove(0);
                                }
                            });
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    fn subscribe_all(&self) -> Result<(), TransportError> {
        for filter in &self.filters {
            self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce)?;
            debug!("Subscribed to {}", filter);
        }
        info!("Subscribed to {} topic filters", self.filters.len());
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.connection_state = state);
    }
}

/// Hands every outbound message to the client, waiting while its request queue is
/// full. Ends on shutdown, when the outbound queue closes or the event loop is gone.
async fn publish_outbound(
    client: AsyncClient,
    mut outbound: mpsc::Receiver<MqttMessage>,
    status: Arc<watch::Sender<MqttStatus>>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("Outbound queue closed, only receiving from now on");
                    break;
                }
            },
        };

        let payload = msg.encode();
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = client.publish(msg.topic.as_str(), QoS::AtMostOnce, false, payload) => sent,
        };

        match sent {
            Ok(()) => {
                debug!("Published to {}: {}", msg.topic, msg.payload);
                status.send_modify(|s| {
                    s.messages_sent += 1;
                    s.last_activity = Some(chrono::Local::now());
                });
            }
            Err(e) => {
                error!("MQTT client gone, dropping publication to {}: {}", msg.topic, e);
                break;
            }
        }
    }
}
