//! 接入桥进程配置加载与配置表轮询。

pub mod watcher;

pub use watcher::{ConfigChange, ConfigWatcher, WatchError, WatcherConfig, config_channel, classify_change};

use ems_decode::TopicSchema;
use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 时长类配置的上限（1 天），避免计算截止时间时溢出。
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// 进程运行配置（环境变量，可由 `.env` 补充）。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub timeseries_database_url: String,
    pub config_database_url: String,
    /// 为空时不启动状态 HTTP 服务。
    pub status_addr: Option<String>,
    pub config_poll_interval: Duration,
    pub topic_schema: TopicSchema,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_max_age: Duration,
    pub batch_max_backlog: usize,
    pub write_max_retries: u32,
    pub write_backoff: Duration,
    pub write_max_backoff: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub mqtt_keepalive: Duration,
    pub mqtt_connect_timeout: Duration,
    pub storage_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub stats_log_every: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeseries_database_url = read_required("EMS_TIMESERIES_DATABASE_URL")?;
        let config_database_url = read_required("EMS_CONFIG_DATABASE_URL")?;
        let status_addr = match env::var("EMS_STATUS_ADDR") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => Some("127.0.0.1:8090".to_string()),
        };
        let config_poll_interval = read_seconds("EMS_CONFIG_POLL_INTERVAL_SECONDS", 30)?;
        let topic_schema = match read_optional("EMS_TOPIC_SCHEMA") {
            Some(value) => value
                .parse::<TopicSchema>()
                .map_err(|_| ConfigError::Invalid("EMS_TOPIC_SCHEMA".to_string(), value))?,
            None => TopicSchema::default(),
        };
        let queue_capacity = read_positive_u64("EMS_QUEUE_CAPACITY", 1000)? as usize;
        let batch_size = read_positive_u64("EMS_BATCH_SIZE", 500)? as usize;
        let batch_max_age = read_millis("EMS_BATCH_MAX_AGE_MS", 1000)?;
        let batch_max_backlog = read_positive_u64("EMS_BATCH_MAX_BACKLOG", 10_000)? as usize;
        if batch_max_backlog < batch_size {
            return Err(ConfigError::Invalid(
                "EMS_BATCH_MAX_BACKLOG".to_string(),
                batch_max_backlog.to_string(),
            ));
        }
        let write_max_retries = read_u32_with_default("EMS_WRITE_MAX_RETRIES", 3)?;
        let write_backoff = read_millis("EMS_WRITE_BACKOFF_MS", 200)?;
        let write_max_backoff = read_millis("EMS_WRITE_MAX_BACKOFF_MS", 10_000)?;
        let reconnect_min = read_millis("EMS_RECONNECT_MIN_MS", 1000)?;
        let reconnect_max = read_millis("EMS_RECONNECT_MAX_MS", 60_000)?;
        if reconnect_max < reconnect_min {
            return Err(ConfigError::Invalid(
                "EMS_RECONNECT_MAX_MS".to_string(),
                reconnect_max.as_millis().to_string(),
            ));
        }
        let mqtt_keepalive = read_seconds("EMS_MQTT_KEEPALIVE_SECONDS", 60)?;
        let mqtt_connect_timeout = read_seconds("EMS_MQTT_CONNECT_TIMEOUT_SECONDS", 10)?;
        let storage_timeout = read_seconds("EMS_STORAGE_TIMEOUT_SECONDS", 10)?;
        let shutdown_timeout = read_seconds("EMS_SHUTDOWN_TIMEOUT_SECONDS", 10)?;
        let stats_log_every = read_u64_with_default("EMS_STATS_LOG_EVERY", 1000)?;

        Ok(Self {
            timeseries_database_url,
            config_database_url,
            status_addr,
            config_poll_interval,
            topic_schema,
            queue_capacity,
            batch_size,
            batch_max_age,
            batch_max_backlog,
            write_max_retries,
            write_backoff,
            write_max_backoff,
            reconnect_min,
            reconnect_max,
            mqtt_keepalive,
            mqtt_connect_timeout,
            storage_timeout,
            shutdown_timeout,
            stats_log_every,
        })
    }
}

fn read_required(key: &str) -> Result<String, ConfigError> {
    read_optional(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match read_optional(key) {
        Some(value) => value,
        None => return Ok(default),
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

/// 读取必须大于 0 的 u64。
fn read_positive_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match read_u64_with_default(key, default)? {
        0 => Err(ConfigError::Invalid(key.to_string(), "0".to_string())),
        value => Ok(value),
    }
}

/// 读取毫秒时长，超过上限按上限处理。
fn read_millis(key: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(read_positive_u64(key, default)?).min(MAX_DURATION))
}

fn read_seconds(key: &str, default: u64) -> Result<Duration, ConfigError> {
    let seconds = read_positive_u64(key, default)?.min(MAX_DURATION.as_secs());
    Ok(Duration::from_secs(seconds))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match read_optional(key) {
        Some(value) => value,
        None => return Ok(default),
    };
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}
