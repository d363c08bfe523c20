use async_trait::async_trait;
use domain::{BackoffPolicy, BridgeConfig, ConnectionState, ConnectionStatus, Reading};
use ems_bridge::{BridgeDeps, BridgeError, BridgeSettings, Coordinator};
use ems_config::WatcherConfig;
use ems_ingest::{BrokerConnector, BrokerSession, Inbound, IngestError, SupervisorConfig};
use ems_pipeline::WriterConfig;
use ems_storage::{
    BridgeConfigRecord, BridgeConfigStore, InMemoryBridgeConfigStore, InMemoryReadingStore,
    InsertReport, ReadingQuery, ReadingStore, StorageError,
};
use ems_telemetry::TelemetryMetrics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// 每次连接都新建一个会话，测试通过 `publish` 向当前会话推送消息。
#[derive(Default)]
struct ScriptedBroker {
    current: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    brokers: Mutex<Vec<String>>,
}

impl ScriptedBroker {
    fn publish(&self, topic: &str, payload: &str) {
        if let Some(sender) = self.current.lock().expect("current").as_ref() {
            let _ = sender.send(Inbound {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
            });
        }
    }

    fn brokers(&self) -> Vec<String> {
        self.brokers.lock().expect("brokers").clone()
    }
}

struct ScriptedSession(mpsc::UnboundedReceiver<Inbound>);

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn next_message(&mut self) -> Result<Inbound, IngestError> {
        self.0
            .recv()
            .await
            .ok_or_else(|| IngestError::Closed("closed".to_string()))
    }

    async fn disconnect(&mut self) {}
}

struct Connector(Arc<ScriptedBroker>);

#[async_trait]
impl BrokerConnector for Connector {
    async fn connect(&self, config: &BridgeConfig) -> Result<Box<dyn BrokerSession>, IngestError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.current.lock().expect("current") = Some(tx);
        self.0.brokers.lock().expect("brokers").push(config.broker.clone());
        Ok(Box::new(ScriptedSession(rx)))
    }
}

fn settings() -> BridgeSettings {
    BridgeSettings {
        writer: WriterConfig {
            batch_size: 100,
            max_batch_age: Duration::from_secs(60),
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100))
                .with_jitter(0.0),
            ..WriterConfig::default()
        },
        supervisor: SupervisorConfig {
            reconnect: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(0.0),
            stats_log_every: 0,
        },
        watcher: WatcherConfig {
            poll_interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(1),
        },
        ..BridgeSettings::default()
    }
}

fn enabled(broker: &str) -> BridgeConfig {
    BridgeConfig {
        broker: broker.to_string(),
        enabled: true,
        ..BridgeConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn readings_flow_to_storage_and_flush_on_shutdown() {
    let broker = Arc::new(ScriptedBroker::default());
    let readings = Arc::new(InMemoryReadingStore::new());
    let config_store = Arc::new(InMemoryBridgeConfigStore::with_config(enabled("a")));
    let metrics = Arc::new(TelemetryMetrics::new());
    let coordinator = Coordinator::new(
        settings(),
        BridgeDeps {
            readings: readings.clone(),
            config_store: config_store.clone(),
            connector: Arc::new(Connector(broker.clone())),
        },
        metrics.clone(),
    );
    let status_rx = coordinator.status_receiver();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until(|| status_rx.borrow().state == ConnectionState::Connected).await;
    broker.publish("site1/ahu1/zone1/temp", r#"{"value": 21.5, "units": "°C"}"#);
    broker.publish("site1/ahu1/zone1/temp", "not_a_number");
    broker.publish("site1/ahu1/zone1/rh", "45");
    wait_until(|| metrics.snapshot().messages_received == 3).await;
    // 批次未满且未到时间阈值，仍在缓冲中
    assert_eq!(readings.len(), 0);

    shutdown_tx.send(true).expect("shutdown");
    handle
        .await
        .expect("coordinator")
        .expect("clean shutdown");

    assert_eq!(readings.len(), 2);
    let temp = readings
        .query_readings(ReadingQuery::point("temp"))
        .await
        .expect("query");
    assert_eq!(temp.len(), 1);
    assert_eq!(temp[0].value, 21.5);
    assert_eq!(metrics.snapshot().decode_errors, 1);

    let statuses = config_store.statuses();
    assert!(statuses.iter().any(|status| status.state == ConnectionState::Connected));
    assert_eq!(
        statuses.last().map(|status| status.state),
        Some(ConnectionState::Disconnected)
    );
    let record = config_store.record().expect("record");
    assert_eq!(record.connection_status.as_deref(), Some("disconnected"));
    assert!(record.last_connected_ms.is_some());
}

#[tokio::test(start_paused = true)]
async fn config_row_change_is_picked_up_on_next_poll() {
    let broker = Arc::new(ScriptedBroker::default());
    let config_store = Arc::new(InMemoryBridgeConfigStore::with_config(enabled("a")));
    let coordinator = Coordinator::new(
        settings(),
        BridgeDeps {
            readings: Arc::new(InMemoryReadingStore::new()),
            config_store: config_store.clone(),
            connector: Arc::new(Connector(broker.clone())),
        },
        Arc::new(TelemetryMetrics::new()),
    );
    let status_rx = coordinator.status_receiver();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until(|| status_rx.borrow().state == ConnectionState::Connected).await;
    config_store.set_config(enabled("b"));
    wait_until(|| broker.brokers() == vec!["a".to_string(), "b".to_string()]).await;

    config_store.set_config(BridgeConfig {
        enabled: false,
        ..enabled("b")
    });
    wait_until(|| status_rx.borrow().state == ConnectionState::Disabled).await;

    shutdown_tx.send(true).expect("shutdown");
    handle
        .await
        .expect("coordinator")
        .expect("clean shutdown");
    assert_eq!(
        config_store.record().and_then(|record| record.connection_status),
        Some("disabled".to_string())
    );
}

/// 会话建立后立即断开。
struct FlappingConnector;

struct DroppedSession;

#[async_trait]
impl BrokerSession for DroppedSession {
    async fn next_message(&mut self) -> Result<Inbound, IngestError> {
        Err(IngestError::Closed("connection reset".to_string()))
    }

    async fn disconnect(&mut self) {}
}

#[async_trait]
impl BrokerConnector for FlappingConnector {
    async fn connect(&self, _config: &BridgeConfig) -> Result<Box<dyn BrokerSession>, IngestError> {
        Ok(Box::new(DroppedSession))
    }
}

struct PanickingConnector;

#[async_trait]
impl BrokerConnector for PanickingConnector {
    async fn connect(&self, _config: &BridgeConfig) -> Result<Box<dyn BrokerSession>, IngestError> {
        panic!("connector bug");
    }
}

/// 状态回写较慢的配置表。
struct SlowStatusStore {
    inner: InMemoryBridgeConfigStore,
    delay: Duration,
}

#[async_trait]
impl BridgeConfigStore for SlowStatusStore {
    async fn fetch_bridge_config(&self) -> Result<Option<BridgeConfigRecord>, StorageError> {
        self.inner.fetch_bridge_config().await
    }

    async fn update_connection_status(
        &self,
        status: &ConnectionStatus,
    ) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_connection_status(status).await
    }
}

/// 写入永远不返回的时序库。
struct StalledReadings;

#[async_trait]
impl ReadingStore for StalledReadings {
    async fn insert_readings(&self, _readings: &[Reading]) -> Result<InsertReport, StorageError> {
        std::future::pending().await
    }

    async fn query_readings(&self, _query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn last_connected_is_written_when_connection_flaps() {
    let config_store = Arc::new(SlowStatusStore {
        inner: InMemoryBridgeConfigStore::with_config(enabled("a")),
        delay: Duration::from_millis(500),
    });
    let metrics = Arc::new(TelemetryMetrics::new());
    let coordinator = Coordinator::new(
        settings(),
        BridgeDeps {
            readings: Arc::new(InMemoryReadingStore::new()),
            config_store: config_store.clone(),
            connector: Arc::new(FlappingConnector),
        },
        metrics.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until(|| metrics.snapshot().connect_successes >= 3).await;
    wait_until(|| {
        config_store
            .inner
            .record()
            .is_some_and(|record| record.last_connected_ms.is_some())
    })
    .await;

    shutdown_tx.send(true).expect("shutdown");
    handle
        .await
        .expect("coordinator")
        .expect("clean shutdown");
    let record = config_store.inner.record().expect("record");
    assert!(record.last_connected_ms.is_some());
    assert_eq!(record.connection_status.as_deref(), Some("disconnected"));
}

#[tokio::test(start_paused = true)]
async fn crashed_task_stops_the_bridge() {
    let config_store = Arc::new(InMemoryBridgeConfigStore::with_config(enabled("a")));
    let coordinator = Coordinator::new(
        settings(),
        BridgeDeps {
            readings: Arc::new(InMemoryReadingStore::new()),
            config_store: config_store.clone(),
            connector: Arc::new(PanickingConnector),
        },
        Arc::new(TelemetryMetrics::new()),
    );
    let status_rx = coordinator.status_receiver();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::time::timeout(Duration::from_secs(60), coordinator.run(shutdown_rx))
        .await
        .expect("coordinator returns without a shutdown signal");
    assert!(matches!(result, Err(BridgeError::TaskFailed("supervisor"))));
    assert_eq!(
        config_store.record().and_then(|record| record.connection_status),
        Some("disconnected".to_string())
    );
    assert_ne!(status_rx.borrow().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn stalled_storage_does_not_block_shutdown() {
    let broker = Arc::new(ScriptedBroker::default());
    let metrics = Arc::new(TelemetryMetrics::new());
    let mut settings = settings();
    settings.writer.storage_timeout = Duration::from_secs(30);
    settings.shutdown_timeout = Duration::from_secs(5);
    let coordinator = Coordinator::new(
        settings,
        BridgeDeps {
            readings: Arc::new(StalledReadings),
            config_store: Arc::new(InMemoryBridgeConfigStore::with_config(enabled("a"))),
            connector: Arc::new(Connector(broker.clone())),
        },
        metrics.clone(),
    );
    let status_rx = coordinator.status_receiver();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until(|| status_rx.borrow().state == ConnectionState::Connected).await;
    broker.publish("site1/ahu1/zone1/temp", "21.5");
    wait_until(|| metrics.snapshot().messages_received == 1).await;

    let started = Instant::now();
    shutdown_tx.send(true).expect("shutdown");
    handle
        .await
        .expect("coordinator")
        .expect("clean shutdown");
    // 写出剩余缓冲的任务在关停截止时间被中止
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert_eq!(metrics.snapshot().rows_written, 0);
}
