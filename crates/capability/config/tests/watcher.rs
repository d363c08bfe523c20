use domain::{BridgeConfig, ConfigValidationError, TlsMode};
use ems_config::{
    ConfigChange, ConfigWatcher, WatchError, WatcherConfig, classify_change, config_channel,
};
use ems_storage::{BridgeConfigStore, InMemoryBridgeConfigStore};
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn base_config() -> BridgeConfig {
    BridgeConfig {
        broker: "broker.local".to_string(),
        enabled: true,
        topic_patterns: vec!["bacnet/#".to_string(), "site1/+/+/temp".to_string()],
        ..BridgeConfig::default()
    }
}

struct Setup {
    store: Arc<InMemoryBridgeConfigStore>,
    watcher: ConfigWatcher,
    config_rx: watch::Receiver<Option<Arc<BridgeConfig>>>,
    metrics: Arc<TelemetryMetrics>,
}

fn setup(initial: Option<BridgeConfig>) -> Setup {
    let store = Arc::new(match initial {
        Some(config) => InMemoryBridgeConfigStore::with_config(config),
        None => InMemoryBridgeConfigStore::new(),
    });
    let metrics = Arc::new(TelemetryMetrics::new());
    let (config_tx, config_rx) = config_channel();
    let watcher = ConfigWatcher::new(
        store.clone() as Arc<dyn BridgeConfigStore>,
        config_tx,
        metrics.clone(),
        WatcherConfig {
            poll_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
        },
    );
    Setup {
        store,
        watcher,
        config_rx,
        metrics,
    }
}

#[test]
fn classification_rules() {
    let active = base_config();
    assert_eq!(classify_change(None, &active), ConfigChange::Initial);
    assert_eq!(classify_change(Some(&active), &active), ConfigChange::Unchanged);

    // topic 顺序变化不算变更
    let reordered = BridgeConfig {
        topic_patterns: vec!["site1/+/+/temp".to_string(), "bacnet/#".to_string()],
        ..active.clone()
    };
    assert_eq!(classify_change(Some(&active), &reordered), ConfigChange::NoOp);

    // 无 username 时 password 无意义
    let password_only = BridgeConfig {
        password: "ignored".to_string(),
        ..active.clone()
    };
    assert_eq!(classify_change(Some(&active), &password_only), ConfigChange::NoOp);

    // 非 secure 模式下 CA 路径无意义
    let ca_only = BridgeConfig {
        ca_cert_path: Some("/etc/ca.pem".to_string()),
        ..active.clone()
    };
    assert_eq!(classify_change(Some(&active), &ca_only), ConfigChange::NoOp);

    let moved = BridgeConfig {
        broker: "other.local".to_string(),
        port: 8883,
        ..active.clone()
    };
    assert_eq!(
        classify_change(Some(&active), &moved),
        ConfigChange::Reconnect(vec!["broker", "port"])
    );

    let renamed = BridgeConfig {
        client_id: "bridge-2".to_string(),
        ..active.clone()
    };
    assert!(classify_change(Some(&active), &renamed).requires_reconnect());
}

#[tokio::test]
async fn first_poll_delivers_snapshot() {
    let mut setup = setup(Some(base_config()));
    let change = setup.watcher.poll_once().await.expect("poll");
    assert_eq!(change, ConfigChange::Initial);

    let delivered = setup.config_rx.borrow_and_update().clone().expect("config");
    assert_eq!(*delivered, base_config());
    assert_eq!(setup.metrics.snapshot().config_reloads, 1);

    let again = setup.watcher.poll_once().await.expect("poll");
    assert_eq!(again, ConfigChange::Unchanged);
    assert!(!setup.config_rx.has_changed().expect("channel open"));
}

#[tokio::test]
async fn secure_without_ca_is_rejected_and_previous_stays_active() {
    let mut setup = setup(Some(base_config()));
    setup.watcher.poll_once().await.expect("poll");
    setup.config_rx.borrow_and_update();

    setup.store.set_config(BridgeConfig {
        tls_mode: TlsMode::Secure,
        ca_cert_path: None,
        ..base_config()
    });
    for _ in 0..3 {
        let err = setup.watcher.poll_once().await.expect_err("rejected");
        assert!(matches!(
            err,
            WatchError::Rejected(ConfigValidationError::MissingCaCertPath)
        ));
    }

    assert!(!setup.config_rx.has_changed().expect("channel open"));
    assert_eq!(
        setup.watcher.active().map(|config| config.tls_mode),
        Some(TlsMode::Disabled)
    );
    let snapshot = setup.metrics.snapshot();
    assert_eq!(snapshot.config_rejected, 3);
    assert_eq!(snapshot.config_reloads, 1);

    setup.store.set_config(BridgeConfig {
        tls_mode: TlsMode::Secure,
        ca_cert_path: Some("/etc/ems/ca.pem".to_string()),
        port: 8883,
        ..base_config()
    });
    let change = setup.watcher.poll_once().await.expect("poll");
    assert_eq!(change, ConfigChange::Reconnect(vec!["port", "tls_mode", "ca_cert_path"]));
    assert!(setup.config_rx.has_changed().expect("channel open"));
}

#[tokio::test]
async fn fetch_failure_and_missing_row_keep_active_config() {
    let mut setup = setup(Some(base_config()));
    setup.watcher.poll_once().await.expect("poll");
    setup.config_rx.borrow_and_update();

    setup.store.set_fetch_failure(true);
    assert!(matches!(
        setup.watcher.poll_once().await,
        Err(WatchError::Fetch(_))
    ));
    setup.store.set_fetch_failure(false);

    setup.store.clear_config();
    assert!(matches!(
        setup.watcher.poll_once().await,
        Err(WatchError::Missing)
    ));

    assert!(!setup.config_rx.has_changed().expect("channel open"));
    assert_eq!(setup.watcher.active().map(|config| (**config).clone()), Some(base_config()));
}

#[tokio::test]
async fn no_op_change_is_not_delivered() {
    let mut setup = setup(Some(base_config()));
    setup.watcher.poll_once().await.expect("poll");
    setup.config_rx.borrow_and_update();

    setup.store.set_config(BridgeConfig {
        topic_patterns: vec!["site1/+/+/temp".to_string(), "bacnet/#".to_string()],
        ..base_config()
    });
    let change = setup.watcher.poll_once().await.expect("poll");
    assert_eq!(change, ConfigChange::NoOp);
    assert!(!setup.config_rx.has_changed().expect("channel open"));
    assert_eq!(setup.metrics.snapshot().config_reloads, 1);
}

#[tokio::test(start_paused = true)]
async fn run_polls_on_interval_until_shutdown() {
    let setup = setup(None);
    let store = setup.store.clone();
    let mut config_rx = setup.config_rx.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(setup.watcher.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.fetch_calls(), 1);
    assert!(config_rx.borrow().is_none());

    store.set_config(base_config());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.fetch_calls(), 2);
    assert!(config_rx.borrow_and_update().is_some());

    shutdown_tx.send(true).expect("shutdown");
    handle.await.expect("watcher task");
}
