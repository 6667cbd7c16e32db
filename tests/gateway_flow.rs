use lightpost_sim::mqtt::message_manager::{InboundMessage, MqttMessage};
use lightpost_sim::publisher::{PublisherSettings, PublisherState};
use lightpost_sim::service::Gateway;
use lightpost_sim::store::{DeviceStore, JsonFilePersistence, MergePolicy, Values};
use lightpost_sim::topic::{MessageKind, Scope, TopicScheme};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn values(value: Value) -> Values {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

struct Harness {
    gateway: Gateway,
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::Receiver<MqttMessage>,
    shutdown: CancellationToken,
    dispatch: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(store: Arc<DeviceStore>, settings: PublisherSettings) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let gateway = Gateway::new(store, TopicScheme::new("gw"), outbound_tx, settings).unwrap();
        let shutdown = CancellationToken::new();
        let dispatch = gateway.spawn_dispatch(inbound_rx, shutdown.clone());

        Self {
            gateway,
            inbound: inbound_tx,
            outbound: outbound_rx,
            shutdown,
            dispatch,
        }
    }

    async fn send(&self, topic: &str, payload: &str) {
        self.inbound
            .send(InboundMessage::new(topic, payload.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    async fn next(&mut self) -> MqttMessage {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a publication")
            .expect("outbound queue closed")
    }

    async fn finish(self) -> (Gateway, mpsc::Receiver<MqttMessage>) {
        self.shutdown.cancel();
        self.dispatch.await.unwrap();
        (self.gateway, self.outbound)
    }
}

#[tokio::test]
async fn config_publishes_snapshot_and_echo() {
    let mut h = Harness::start(Arc::new(DeviceStore::in_memory()), PublisherSettings::default());

    h.send("gw/lightpost/TAGA/config", r#"{"Interval": 30}"#).await;

    let act = h.next().await;
    assert_eq!(act.topic, "gw/lightpost/TAGA/act_value");
    assert_eq!(act.payload, json!({"Interval": 30}));
    let echo = h.next().await;
    assert_eq!(echo.topic, "gw/lightpost/TAGA/response");
    assert_eq!(echo.encode(), br#"{"Interval":30}"#.to_vec());

    let (gateway, _) = h.finish().await;
    assert_eq!(
        gateway.store().snapshot(&Scope::device("TAGA")).await,
        values(json!({"Interval": 30}))
    );
}

#[tokio::test]
async fn request_answers_only_known_variables() {
    let mut h = Harness::start(Arc::new(DeviceStore::in_memory()), PublisherSettings::default());

    h.send("gw/lightpost/TAGA/config", r#"{"Interval": 30}"#).await;
    h.next().await;
    h.next().await;

    h.send("gw/lightpost/TAGA/request", r#"["Interval", "Missing"]"#).await;
    let answer = h.next().await;
    assert_eq!(answer.topic, "gw/lightpost/TAGA/response");
    assert_eq!(answer.payload, json!({"Interval": 30}));

    // nothing matches, so nothing is published; the core config below is the next output
    h.send("gw/lightpost/TAGA/request", r#"["Missing"]"#).await;
    h.send("gw/config", r#"{"Mode": "auto"}"#).await;
    assert_eq!(h.next().await.topic, "gw/act_value");

    let (gateway, _) = h.finish().await;
    let stats = gateway.diagnostics().snapshot();
    assert_eq!(stats.lookup_misses, 2);
    assert_eq!(stats.handled, 4);
}

#[tokio::test]
async fn bad_messages_do_not_stop_the_loop() {
    let mut h = Harness::start(Arc::new(DeviceStore::in_memory()), PublisherSettings::default());

    h.send("gw/lightpost/TAGA/config", "not json").await;
    h.send("gw/lightpost/TAGA/config", r#"{"Nested": {"a": 1}}"#).await;
    h.send("gw/lightpost/TAGA/request", r#"{"Interval": 1}"#).await;
    h.send("gw/lightpost//config", r#"{"Interval": 1}"#).await;
    h.send("gw/telemetry", r#"{"Interval": 1}"#).await;
    h.send("gw/lightpost/TAGA/act_value", r#"{"Interval": 1}"#).await;
    h.send("gw/lightpost/TAGB/config", r#"{"LightPower": 70}"#).await;

    let act = h.next().await;
    assert_eq!(act.topic, "gw/lightpost/TAGB/act_value");
    assert_eq!(act.payload, json!({"LightPower": 70}));

    let (gateway, _) = h.finish().await;
    assert!(gateway.store().snapshot(&Scope::device("TAGA")).await.is_empty());
    let stats = gateway.diagnostics().snapshot();
    assert_eq!(stats.dropped, 5);
}

#[tokio::test]
async fn strict_schema_keeps_record_shape() {
    let store = Arc::new(DeviceStore::new(
        Arc::new(lightpost_sim::store::MemoryPersistence::with_records([(
            Scope::Core,
            values(json!({"Interval": 60, "LightPower": 100})),
        )])),
        MergePolicy::Strict,
    ));
    let mut h = Harness::start(store, PublisherSettings::default());

    h.send("gw/config", r#"{"Interval": 15, "Unknown": true}"#).await;
    let act = h.next().await;
    assert_eq!(act.payload, json!({"Interval": 15, "LightPower": 100}));

    let (gateway, _) = h.finish().await;
    assert_eq!(gateway.diagnostics().snapshot().rejected_keys, 1);
}

#[tokio::test]
async fn interleaved_devices_stay_isolated() {
    let mut h = Harness::start(Arc::new(DeviceStore::in_memory()), PublisherSettings::default());

    for i in 0..20 {
        let tag = if i % 2 == 0 { "EVEN" } else { "ODD" };
        h.send(
            &format!("gw/lightpost/{}/config", tag),
            &format!(r#"{{"Last": {}, "Key{}": {}}}"#, i, i, i),
        )
        .await;
    }
    for _ in 0..40 {
        h.next().await;
    }

    let (gateway, _) = h.finish().await;
    let even = gateway.store().snapshot(&Scope::device("EVEN")).await;
    let odd = gateway.store().snapshot(&Scope::device("ODD")).await;
    assert_eq!(even.len(), 11);
    assert_eq!(odd.len(), 11);
    assert_eq!(even.get("Last"), Some(&json!(18)));
    assert_eq!(odd.get("Last"), Some(&json!(19)));
    assert!(even
        .keys()
        .filter(|k| *k != "Last")
        .all(|k| k.trim_start_matches("Key").parse::<u32>().unwrap() % 2 == 0));
}

#[tokio::test(start_paused = true)]
async fn timed_publisher_follows_interval() {
    let store = Arc::new(DeviceStore::in_memory());
    store.preload([Scope::device("A"), Scope::device("B")]).await;
    let settings = PublisherSettings {
        interval: Duration::from_secs(1),
        ..PublisherSettings::default()
    };
    let h = Harness::start(store, settings);
    let publisher = h.gateway.publisher();

    publisher.start().await.unwrap();
    assert_eq!(publisher.state(), PublisherState::Running);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(publisher.stop().await, Some(4));
    assert_eq!(publisher.state(), PublisherState::Stopped);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (_, mut outbound) = h.finish().await;

    let mut per_target = std::collections::HashMap::<String, usize>::new();
    while let Ok(msg) = outbound.try_recv() {
        *per_target.entry(msg.topic).or_default() += 1;
    }
    assert_eq!(per_target.len(), 2);
    assert_eq!(per_target.get("gw/lightpost/A/act_value"), Some(&2));
    assert_eq!(per_target.get("gw/lightpost/B/act_value"), Some(&2));
}

async fn file_store(dir: &std::path::Path) -> Arc<DeviceStore> {
    Arc::new(DeviceStore::new(
        Arc::new(JsonFilePersistence::open(dir).await.unwrap()),
        MergePolicy::Open,
    ))
}

#[tokio::test]
async fn records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let mut h = Harness::start(file_store(dir.path()).await, PublisherSettings::default());
    h.send("gw/lightpost/TAGA/config", r#"{"Interval": 45}"#).await;
    h.next().await;
    h.next().await;
    h.finish().await;

    let mut h = Harness::start(file_store(dir.path()).await, PublisherSettings::default());
    h.send("gw/lightpost/TAGA/request", r#"["Interval"]"#).await;
    let answer = h.next().await;
    assert_eq!(answer.payload, json!({"Interval": 45}));
    h.finish().await;
}

#[tokio::test]
async fn announce_publishes_core_snapshot() {
    let store = Arc::new(DeviceStore::in_memory());
    store
        .set(&Scope::Core, values(json!({"Timestamp": "2024-01-01T00:00:00"})))
        .await
        .unwrap();
    let mut h = Harness::start(store, PublisherSettings::default());

    h.gateway.announce().await;
    let msg = h.next().await;
    assert_eq!(msg.topic, h.gateway.topics().topic_for(&Scope::Core, MessageKind::ActValue));
    assert_eq!(msg.payload, json!({"Timestamp": "2024-01-01T00:00:00"}));
    h.finish().await;
}
