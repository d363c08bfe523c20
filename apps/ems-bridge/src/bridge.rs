//! Bridge Coordinator：装配并托管 Config Watcher、Connection Supervisor、Batch Writer 与状态回写。
//!
//! 关停顺序：
//! 1. Watcher 与 Supervisor 观察到关停信号，Supervisor 优雅断开
//! 2. Supervisor 退出后通知 Writer，Writer 写出剩余缓冲
//! 3. 状态回写任务写完最后一次状态后退出
//!
//! 全部步骤共享一个关停超时，超时的任务被中止。

use domain::{BackoffPolicy, ConnectionState, ConnectionStatus, now_epoch_ms};
use ems_config::{AppConfig, ConfigWatcher, WatcherConfig, config_channel};
use ems_decode::Decoder;
use ems_ingest::{BrokerConnector, ConnectionSupervisor, SupervisorConfig, status_channel};
use ems_pipeline::{BatchWriter, WriterConfig, intake_queue};
use ems_storage::{BridgeConfigStore, ReadingStore};
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SUPERVISOR: &str = "supervisor";
const CONFIG_WATCHER: &str = "config_watcher";
const BATCH_WRITER: &str = "batch_writer";

/// Coordinator 异常退出原因。
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0} task exited unexpectedly")]
    TaskFailed(&'static str),
}

/// Coordinator 参数。
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub decoder: Decoder,
    pub queue_capacity: usize,
    pub writer: WriterConfig,
    pub supervisor: SupervisorConfig,
    pub watcher: WatcherConfig,
    /// 状态回写超时。
    pub storage_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            decoder: Decoder::default(),
            queue_capacity: 1000,
            writer: WriterConfig::default(),
            supervisor: SupervisorConfig::default(),
            watcher: WatcherConfig::default(),
            storage_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            decoder: Decoder::new(config.topic_schema.clone()),
            queue_capacity: config.queue_capacity,
            writer: WriterConfig {
                batch_size: config.batch_size,
                max_batch_age: config.batch_max_age,
                max_backlog: config.batch_max_backlog,
                max_retries: config.write_max_retries,
                backoff: BackoffPolicy::new(config.write_backoff, config.write_max_backoff),
                storage_timeout: config.storage_timeout,
            },
            supervisor: SupervisorConfig {
                reconnect: BackoffPolicy::new(config.reconnect_min, config.reconnect_max),
                stats_log_every: config.stats_log_every,
            },
            watcher: WatcherConfig {
                poll_interval: config.config_poll_interval,
                fetch_timeout: config.storage_timeout,
            },
            storage_timeout: config.storage_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// 外部依赖（存储与 broker），测试中以内存实现替换。
#[derive(Clone)]
pub struct BridgeDeps {
    pub readings: Arc<dyn ReadingStore>,
    pub config_store: Arc<dyn BridgeConfigStore>,
    pub connector: Arc<dyn BrokerConnector>,
}

pub struct Coordinator {
    settings: BridgeSettings,
    deps: BridgeDeps,
    metrics: Arc<TelemetryMetrics>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl Coordinator {
    pub fn new(settings: BridgeSettings, deps: BridgeDeps, metrics: Arc<TelemetryMetrics>) -> Self {
        let (status_tx, status_rx) = status_channel();
        Self {
            settings,
            deps,
            metrics,
            status_tx,
            status_rx,
        }
    }

    /// 连接状态订阅（供状态 HTTP 服务使用）。
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// 运行直到收到关停信号或某个任务异常退出，并在关停超时内完成收尾。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        let Coordinator {
            settings,
            deps,
            metrics,
            status_tx,
            status_rx,
        } = self;

        let (sender, receiver) = intake_queue(settings.queue_capacity, metrics.clone());
        let (config_tx, config_rx) = config_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (writer_shutdown_tx, writer_shutdown_rx) = watch::channel(false);

        let watcher = ConfigWatcher::new(
            deps.config_store.clone(),
            config_tx,
            metrics.clone(),
            settings.watcher,
        );
        let supervisor = ConnectionSupervisor::new(
            deps.connector.clone(),
            settings.decoder.clone(),
            sender,
            metrics.clone(),
            config_rx,
            status_tx,
            settings.supervisor.clone(),
        );
        let writer = BatchWriter::new(
            deps.readings.clone(),
            receiver,
            settings.writer.clone(),
            metrics.clone(),
        );

        let final_status_rx = status_rx.clone();
        let mut reporter = tokio::spawn(report_status(
            deps.config_store.clone(),
            status_rx,
            settings.storage_timeout,
        ));
        let mut writer_task = tokio::spawn(writer.run(writer_shutdown_rx));
        let mut supervisor_task = tokio::spawn(supervisor.run(stop_rx.clone()));
        let mut watcher_task = tokio::spawn(watcher.run(stop_rx));
        info!(target: "ems.bridge", "bridge_started");

        // 任一常驻任务提前结束也进入关停流程
        let exited = tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => None,
            result = &mut supervisor_task => Some((SUPERVISOR, result)),
            result = &mut watcher_task => Some((CONFIG_WATCHER, result)),
            result = &mut writer_task => Some((BATCH_WRITER, result)),
        };
        let failed = exited.map(|(task, result)| {
            match result {
                Ok(()) => error!(target: "ems.bridge", task, "task_failed"),
                Err(err) => error!(target: "ems.bridge", task, error = %err, "task_failed"),
            }
            task
        });
        let _ = stop_tx.send(true);
        info!(
            target: "ems.bridge",
            timeout_s = settings.shutdown_timeout.as_secs(),
            "bridge_shutting_down"
        );
        let deadline = Instant::now() + settings.shutdown_timeout;

        if failed != Some(SUPERVISOR) {
            join_until(&mut supervisor_task, deadline, SUPERVISOR).await;
        }
        if failed != Some(CONFIG_WATCHER) {
            join_until(&mut watcher_task, deadline, CONFIG_WATCHER).await;
        }
        // Supervisor 退出后不会再有新读数，通知 Writer 收尾
        let _ = writer_shutdown_tx.send(true);
        if failed != Some(BATCH_WRITER) {
            join_until(&mut writer_task, deadline, BATCH_WRITER).await;
        }
        join_until(&mut reporter, deadline, "status_reporter").await;

        // Supervisor 被中止时最后一次状态可能仍是 connected
        let last = *final_status_rx.borrow();
        if !matches!(
            last.state,
            ConnectionState::Disconnected | ConnectionState::Disabled
        ) {
            let stopped = ConnectionStatus {
                state: ConnectionState::Disconnected,
                changed_at_ms: now_epoch_ms(),
                ..last
            };
            write_status(deps.config_store.as_ref(), &stopped, settings.storage_timeout).await;
        }

        let stats = metrics.snapshot();
        info!(
            target: "ems.bridge",
            received = stats.messages_received,
            written = stats.rows_written,
            decode_errors = stats.decode_errors,
            rows_dropped = stats.rows_dropped,
            backlog_dropped = stats.backlog_dropped,
            "bridge_stopped"
        );
        match failed {
            Some(task) => Err(BridgeError::TaskFailed(task)),
            None => Ok(()),
        }
    }
}

/// 等待任务结束；超过截止时间则中止。
async fn join_until(task: &mut JoinHandle<()>, deadline: Instant, name: &'static str) {
    match tokio::time::timeout_at(deadline, &mut *task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(target: "ems.bridge", task = name, error = %err, "task_failed"),
        Err(_) => {
            task.abort();
            warn!(target: "ems.bridge", task = name, "shutdown_timeout_abort");
        }
    }
}

/// 把每次状态变化回写到配置表；Supervisor 退出（发送端关闭）后写完最后一次状态即结束。
async fn report_status(
    store: Arc<dyn BridgeConfigStore>,
    mut status_rx: watch::Receiver<ConnectionStatus>,
    timeout: Duration,
) {
    let initial = *status_rx.borrow_and_update();
    write_status(store.as_ref(), &initial, timeout).await;
    while status_rx.changed().await.is_ok() {
        let status = *status_rx.borrow_and_update();
        write_status(store.as_ref(), &status, timeout).await;
    }
}

async fn write_status(store: &dyn BridgeConfigStore, status: &ConnectionStatus, timeout: Duration) {
    match tokio::time::timeout(timeout, store.update_connection_status(status)).await {
        Ok(Ok(())) => {
            debug!(target: "ems.bridge", state = %status.state, "status_written");
        }
        Ok(Err(err)) => {
            warn!(target: "ems.bridge", state = %status.state, error = %err, "status_write_failed");
        }
        Err(_) => {
            warn!(target: "ems.bridge", state = %status.state, "status_write_timeout");
        }
    }
}
