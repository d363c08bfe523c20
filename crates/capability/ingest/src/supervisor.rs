//! 连接状态机。
//!
//! ```text
//! Disabled ──enabled──▶ Connecting ──ok──▶ Connected
//!                          │                  │ 传输断开
//!                          ▼ 失败             ▼
//!                     Reconnecting ◀──────────┘   （指数退避 + 抖动）
//! Connected ──需重连的配置变更──▶ Disconnected ──立即──▶ Connecting
//! 任意状态 ──enabled=false──▶ Disabled
//! ```
//!
//! 状态只由本模块修改，通过 `watch` 通道对外发布。

use crate::{BrokerConnector, BrokerSession, Inbound, IngestError};
use domain::{Backoff, BackoffPolicy, BridgeConfig, ConnectionState, ConnectionStatus, now_epoch_ms};
use ems_decode::Decoder;
use ems_pipeline::{EnqueueOutcome, ReadingSender};
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Supervisor 参数。
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconnect: BackoffPolicy,
    /// 每收到多少条消息输出一次统计日志（0 表示不输出）。
    pub stats_log_every: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            stats_log_every: 1000,
        }
    }
}

/// 创建连接状态通道（初始为 Disconnected）。
pub fn status_channel() -> (
    watch::Sender<ConnectionStatus>,
    watch::Receiver<ConnectionStatus>,
) {
    watch::channel(ConnectionStatus::initial(now_epoch_ms()))
}

/// 一次会话结束的原因。
enum SessionEnd {
    Shutdown,
    ConfigChanged,
    Lost(IngestError),
}

/// 等待结束的原因。
enum Wake {
    Shutdown,
    ConfigChanged,
    Timer,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    decoder: Decoder,
    sender: ReadingSender,
    metrics: Arc<TelemetryMetrics>,
    config_rx: watch::Receiver<Option<Arc<BridgeConfig>>>,
    config_open: bool,
    status_tx: watch::Sender<ConnectionStatus>,
    backoff: Backoff,
    stats_log_every: u64,
    /// 当前生效的配置：连接成功（或被禁用）后才替换。
    active: Option<Arc<BridgeConfig>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        decoder: Decoder,
        sender: ReadingSender,
        metrics: Arc<TelemetryMetrics>,
        config_rx: watch::Receiver<Option<Arc<BridgeConfig>>>,
        status_tx: watch::Sender<ConnectionStatus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            connector,
            decoder,
            sender,
            metrics,
            config_rx,
            config_open: true,
            status_tx,
            backoff: Backoff::new(config.reconnect),
            stats_log_every: config.stats_log_every,
            active: None,
        }
    }

    /// 主循环：直到收到关停信号。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let desired = self.config_rx.borrow_and_update().clone();
            let config = match desired {
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    match self.wait(&mut shutdown, None).await {
                        Wake::Shutdown => break,
                        _ => continue,
                    }
                }
                Some(config) if !config.enabled => {
                    self.active = Some(config);
                    self.backoff.reset();
                    self.set_state(ConnectionState::Disabled);
                    match self.wait(&mut shutdown, None).await {
                        Wake::Shutdown => break,
                        _ => continue,
                    }
                }
                Some(config) => config,
            };

            let now = Instant::now();
            if !self.backoff.is_ready(now) {
                let deadline = self.backoff.next_eligible_at();
                match self.wait(&mut shutdown, deadline).await {
                    Wake::Shutdown => break,
                    Wake::ConfigChanged => {
                        // 人为修改的配置立即生效，不再等待退避
                        self.backoff.reset();
                        continue;
                    }
                    Wake::Timer => {}
                }
            }

            if self.current_state() != ConnectionState::Reconnecting {
                self.set_state(ConnectionState::Connecting);
            }
            self.metrics.record_connect_attempt();
            info!(
                target: "ems.ingest",
                endpoint = %config.endpoint(),
                tls_mode = config.tls_mode.as_str(),
                auth = config.has_credentials(),
                topics = ?config.topic_patterns,
                attempt = self.backoff.attempt() + 1,
                "connect_attempt"
            );

            let connector = self.connector.clone();
            let attempt = tokio::select! {
                result = connector.connect(&config) => Some(result),
                wake = wait_signal(&mut shutdown, &mut self.config_rx, &mut self.config_open) => {
                    match wake {
                        Wake::Shutdown => break,
                        _ => None,
                    }
                }
            };
            let Some(result) = attempt else {
                // 配置在握手期间变化：放弃本次尝试，按新配置立即重连
                self.backoff.reset();
                continue;
            };

            match result {
                Err(err) => {
                    let delay = self.backoff.record_failure(Instant::now());
                    self.set_state(ConnectionState::Reconnecting);
                    warn!(
                        target: "ems.ingest",
                        endpoint = %config.endpoint(),
                        error = %err,
                        attempt = self.backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "connect_failed"
                    );
                }
                Ok(mut session) => {
                    self.backoff.reset();
                    self.active = Some(config.clone());
                    self.metrics.record_connect_success();
                    self.set_state(ConnectionState::Connected);

                    match self.pump(&mut session, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            session.disconnect().await;
                            break;
                        }
                        SessionEnd::ConfigChanged => {
                            session.disconnect().await;
                            // 禁用时直接进入 Disabled，不经过 Disconnected
                            if self.desired_enabled() {
                                self.set_state(ConnectionState::Disconnected);
                            }
                            info!(target: "ems.ingest", "disconnected_for_config_change");
                        }
                        SessionEnd::Lost(err) => {
                            let delay = self.backoff.record_failure(Instant::now());
                            self.set_state(ConnectionState::Reconnecting);
                            warn!(
                                target: "ems.ingest",
                                endpoint = %config.endpoint(),
                                error = %err,
                                retry_in_ms = delay.as_millis() as u64,
                                "connection_lost"
                            );
                        }
                    }
                }
            }
        }

        if self.current_state() != ConnectionState::Disabled {
            self.set_state(ConnectionState::Disconnected);
        }
        info!(target: "ems.ingest", "supervisor_stopped");
    }

    /// Connected 状态：逐条处理消息，直到断开、关停或配置变更。
    async fn pump(
        &mut self,
        session: &mut Box<dyn BrokerSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
                changed = self.config_rx.changed(), if self.config_open => {
                    if changed.is_err() {
                        self.config_open = false;
                        continue;
                    }
                    if self.config_differs() {
                        return SessionEnd::ConfigChanged;
                    }
                }
                message = session.next_message() => match message {
                    Ok(inbound) => self.handle_inbound(inbound),
                    Err(err) => return SessionEnd::Lost(err),
                },
            }
        }
    }

    /// 新配置与当前生效配置是否不同（相同则无需重连）。
    fn config_differs(&self) -> bool {
        let desired = self.config_rx.borrow();
        match (desired.as_deref(), self.active.as_deref()) {
            (Some(desired), Some(active)) => desired != active,
            (None, None) => false,
            _ => true,
        }
    }

    fn desired_enabled(&self) -> bool {
        self.config_rx
            .borrow()
            .as_deref()
            .is_some_and(|config| config.enabled)
    }

    fn handle_inbound(&self, inbound: Inbound) {
        let received = self.metrics.record_message_received();
        match self
            .decoder
            .decode(&inbound.topic, &inbound.payload, now_epoch_ms())
        {
            Ok(reading) => {
                self.metrics.record_reading_decoded();
                if self.sender.enqueue(reading) == EnqueueOutcome::DroppedOldest {
                    debug!(target: "ems.ingest", topic = %inbound.topic, "queue_full_dropped_oldest");
                }
            }
            Err(err) => {
                self.metrics.record_decode_error(&inbound.topic);
                warn!(
                    target: "ems.ingest",
                    topic = %inbound.topic,
                    kind = err.kind(),
                    error = %err,
                    "decode_failed"
                );
            }
        }
        if self.stats_log_every > 0 && received % self.stats_log_every == 0 {
            let stats = self.metrics.snapshot();
            info!(
                target: "ems.ingest",
                received = stats.messages_received,
                decoded = stats.readings_decoded,
                decode_errors = stats.decode_errors,
                queue_dropped = stats.queue_dropped,
                written = stats.rows_written,
                duplicates = stats.rows_duplicate,
                rows_dropped = stats.rows_dropped,
                backlog_dropped = stats.backlog_dropped,
                "bridge_stats"
            );
        }
    }

    async fn wait(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Wake {
        tokio::select! {
            wake = wait_signal(shutdown, &mut self.config_rx, &mut self.config_open) => wake,
            _ = sleep_until_opt(deadline) => Wake::Timer,
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    fn set_state(&self, state: ConnectionState) {
        let now = now_epoch_ms();
        let changed = self.status_tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            status.changed_at_ms = now;
            if state == ConnectionState::Connected {
                status.last_connected_ms = Some(now);
            }
            true
        });
        if changed {
            info!(target: "ems.ingest", state = %state, "connection_state_changed");
        }
    }
}

/// 等待关停或配置变更；配置通道关闭后只等待关停。
async fn wait_signal(
    shutdown: &mut watch::Receiver<bool>,
    config_rx: &mut watch::Receiver<Option<Arc<BridgeConfig>>>,
    config_open: &mut bool,
) -> Wake {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Wake::Shutdown;
                }
            }
            changed = config_rx.changed(), if *config_open => {
                if changed.is_err() {
                    *config_open = false;
                    continue;
                }
                return Wake::ConfigChanged;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
