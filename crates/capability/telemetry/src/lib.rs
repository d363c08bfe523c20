//! 追踪初始化、请求 ID 生成与接入桥计数器。

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 按 topic 统计解码失败时最多跟踪的 topic 数量，超出部分归入 [`OTHER_TOPICS`]。
pub const MAX_TRACKED_TOPICS: usize = 1024;
pub const OTHER_TOPICS: &str = "_other";

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub readings_decoded: u64,
    pub decode_errors: u64,
    pub readings_enqueued: u64,
    pub queue_dropped: u64,
    pub rows_written: u64,
    pub rows_duplicate: u64,
    pub rows_retried: u64,
    pub rows_dropped: u64,
    pub backlog_dropped: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub write_latency_ms_total: u64,
    pub write_latency_ms_count: u64,
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub config_reloads: u64,
    pub config_rejected: u64,
}

/// 接入桥计数器。
///
/// 由 Coordinator 创建一份，以 `Arc` 共享给各组件；只增不减。
pub struct TelemetryMetrics {
    messages_received: AtomicU64,
    readings_decoded: AtomicU64,
    decode_errors: AtomicU64,
    readings_enqueued: AtomicU64,
    queue_dropped: AtomicU64,
    rows_written: AtomicU64,
    rows_duplicate: AtomicU64,
    rows_retried: AtomicU64,
    rows_dropped: AtomicU64,
    backlog_dropped: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    write_latency_ms_total: AtomicU64,
    write_latency_ms_count: AtomicU64,
    connect_attempts: AtomicU64,
    connect_successes: AtomicU64,
    config_reloads: AtomicU64,
    config_rejected: AtomicU64,
    decode_errors_by_topic: Mutex<BTreeMap<String, u64>>,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            readings_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            readings_enqueued: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            rows_duplicate: AtomicU64::new(0),
            rows_retried: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            backlog_dropped: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            write_latency_ms_total: AtomicU64::new(0),
            write_latency_ms_count: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_successes: AtomicU64::new(0),
            config_reloads: AtomicU64::new(0),
            config_rejected: AtomicU64::new(0),
            decode_errors_by_topic: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            readings_decoded: self.readings_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            readings_enqueued: self.readings_enqueued.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_duplicate: self.rows_duplicate.load(Ordering::Relaxed),
            rows_retried: self.rows_retried.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            backlog_dropped: self.backlog_dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            write_latency_ms_total: self.write_latency_ms_total.load(Ordering::Relaxed),
            write_latency_ms_count: self.write_latency_ms_count.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_successes: self.connect_successes.load(Ordering::Relaxed),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
            config_rejected: self.config_rejected.load(Ordering::Relaxed),
        }
    }

    /// 按 topic 的解码失败次数。
    pub fn decode_errors_by_topic(&self) -> BTreeMap<String, u64> {
        self.decode_errors_by_topic
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    /// 记录收到的 MQTT 消息，返回累计值。
    pub fn record_message_received(&self) -> u64 {
        self.messages_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reading_decoded(&self) {
        self.readings_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录解码失败（总数 + 按 topic）。
    pub fn record_decode_error(&self, topic: &str) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.decode_errors_by_topic.lock() {
            let key = if map.contains_key(topic) || map.len() < MAX_TRACKED_TOPICS {
                topic
            } else {
                OTHER_TOPICS
            };
            *map.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_reading_enqueued(&self) {
        self.readings_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// 接入队列已满，最旧一条被丢弃。
    pub fn record_queue_dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    /// 存储层按自然键判定为重复、未新增的行。
    pub fn record_rows_duplicate(&self, rows: u64) {
        self.rows_duplicate.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_rows_retried(&self, rows: u64) {
        self.rows_retried.fetch_add(rows, Ordering::Relaxed);
    }

    /// 重试耗尽后丢弃的行。
    pub fn record_rows_dropped(&self, rows: u64) {
        self.rows_dropped.fetch_add(rows, Ordering::Relaxed);
    }

    /// 积压超过上限时丢弃的最旧读数。
    pub fn record_backlog_dropped(&self, rows: u64) {
        self.backlog_dropped.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录写入延迟（毫秒）。
    pub fn record_write_latency_ms(&self, latency_ms: u64) {
        self.write_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.write_latency_ms_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_success(&self) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// 配置变更已下发给 Supervisor。
    pub fn record_config_reload(&self) {
        self.config_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_rejected(&self) {
        self.config_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}
