//! Config Watcher：定时读取配置表，与当前生效配置比较，仅在需要重连的变更时下发新快照。
//!
//! 下发通道是 `watch`（只保留最新值），Supervisor 以“期望状态 vs 生效状态”方式对齐，
//! 错过中间状态不影响结果。

use domain::{BridgeConfig, ConfigValidationError, TlsMode};
use ems_storage::{BridgeConfigStore, StorageError};
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Watcher 参数。
#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// 单次读取超时。
    pub fetch_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// 一次轮询未能生效的原因。原配置在这些情况下都继续使用。
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] StorageError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("config row not found")]
    Missing,
    #[error("config rejected: {0}")]
    Rejected(#[from] ConfigValidationError),
}

/// 新旧配置的差异分类。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    /// 首次读取到配置。
    Initial,
    Unchanged,
    /// 仅有不影响连接的字段变化。
    NoOp,
    /// 需要重连的字段列表。
    Reconnect(Vec<&'static str>),
}

impl ConfigChange {
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, ConfigChange::Initial | ConfigChange::Reconnect(_))
    }
}

/// 创建配置下发通道（初始无配置）。
pub fn config_channel() -> (
    watch::Sender<Option<Arc<BridgeConfig>>>,
    watch::Receiver<Option<Arc<BridgeConfig>>>,
) {
    watch::channel(None)
}

/// 比较新旧配置。
///
/// - topic 过滤器按集合比较
/// - `ca_cert_path` 仅在 secure 模式下有意义
/// - `password` 仅在 username 非空时有意义
pub fn classify_change(active: Option<&BridgeConfig>, next: &BridgeConfig) -> ConfigChange {
    let Some(active) = active else {
        return ConfigChange::Initial;
    };
    if active == next {
        return ConfigChange::Unchanged;
    }

    let mut fields = Vec::new();
    if active.broker != next.broker {
        fields.push("broker");
    }
    if active.port != next.port {
        fields.push("port");
    }
    if active.client_id != next.client_id {
        fields.push("client_id");
    }
    if active.username != next.username {
        fields.push("username");
    }
    if next.has_credentials() && active.password != next.password {
        fields.push("password");
    }
    if active.tls_mode != next.tls_mode {
        fields.push("tls_mode");
    }
    if next.tls_mode == TlsMode::Secure && active.ca_cert_path != next.ca_cert_path {
        fields.push("ca_cert_path");
    }
    if active.topic_set() != next.topic_set() {
        fields.push("topic_patterns");
    }
    if active.qos != next.qos {
        fields.push("qos");
    }
    if active.enabled != next.enabled {
        fields.push("enabled");
    }

    if fields.is_empty() {
        ConfigChange::NoOp
    } else {
        ConfigChange::Reconnect(fields)
    }
}

pub struct ConfigWatcher {
    store: Arc<dyn BridgeConfigStore>,
    config_tx: watch::Sender<Option<Arc<BridgeConfig>>>,
    metrics: Arc<TelemetryMetrics>,
    settings: WatcherConfig,
    /// 最近一次通过校验的配置。
    active: Option<Arc<BridgeConfig>>,
    /// 最近一次被拒绝的配置，同一值只记录一次日志。
    last_rejected: Option<BridgeConfig>,
}

impl ConfigWatcher {
    pub fn new(
        store: Arc<dyn BridgeConfigStore>,
        config_tx: watch::Sender<Option<Arc<BridgeConfig>>>,
        metrics: Arc<TelemetryMetrics>,
        settings: WatcherConfig,
    ) -> Self {
        Self {
            store,
            config_tx,
            metrics,
            settings,
            active: None,
            last_rejected: None,
        }
    }

    pub fn active(&self) -> Option<&Arc<BridgeConfig>> {
        self.active.as_ref()
    }

    /// 主循环：立即读取一次，之后按固定间隔轮询，直到收到关停信号。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "ems.config",
            poll_interval_s = self.settings.poll_interval.as_secs(),
            "config_watcher_started"
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let _ = self.poll_once().await;
                }
            }
        }
        info!(target: "ems.config", "config_watcher_stopped");
    }

    /// 读取、校验、比较并在需要时下发一次。
    pub async fn poll_once(&mut self) -> Result<ConfigChange, WatchError> {
        let fetched =
            match tokio::time::timeout(self.settings.fetch_timeout, self.store.fetch_bridge_config())
                .await
            {
                Ok(Ok(Some(record))) => record.config,
                Ok(Ok(None)) => {
                    debug!(target: "ems.config", "config_row_missing");
                    return Err(WatchError::Missing);
                }
                Ok(Err(err)) => {
                    warn!(target: "ems.config", error = %err, "config_fetch_failed");
                    return Err(WatchError::Fetch(err));
                }
                Err(_) => {
                    let err = WatchError::Timeout(self.settings.fetch_timeout);
                    warn!(target: "ems.config", error = %err, "config_fetch_failed");
                    return Err(err);
                }
            };

        if let Err(err) = fetched.validate() {
            self.metrics.record_config_rejected();
            if self.last_rejected.as_ref() != Some(&fetched) {
                warn!(
                    target: "ems.config",
                    error = %err,
                    broker = %fetched.broker,
                    tls_mode = fetched.tls_mode.as_str(),
                    "config_rejected"
                );
                self.last_rejected = Some(fetched);
            }
            return Err(WatchError::Rejected(err));
        }
        self.last_rejected = None;

        let change = classify_change(self.active.as_deref(), &fetched);
        match &change {
            ConfigChange::Unchanged => {}
            ConfigChange::NoOp => {
                debug!(target: "ems.config", "config_changed_no_reconnect");
                self.active = Some(Arc::new(fetched));
            }
            ConfigChange::Initial | ConfigChange::Reconnect(_) => {
                let snapshot = Arc::new(fetched);
                let fields = match &change {
                    ConfigChange::Reconnect(fields) => fields.clone(),
                    _ => Vec::new(),
                };
                info!(
                    target: "ems.config",
                    endpoint = %snapshot.endpoint(),
                    enabled = snapshot.enabled,
                    tls_mode = snapshot.tls_mode.as_str(),
                    changed = ?fields,
                    "config_applied"
                );
                self.metrics.record_config_reload();
                self.active = Some(snapshot.clone());
                self.config_tx.send_replace(Some(snapshot));
            }
        }
        Ok(change)
    }
}
