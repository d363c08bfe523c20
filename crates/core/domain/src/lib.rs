//! 接入桥的核心领域模型。

pub mod config;
pub mod data;
pub mod retry;
pub mod state;

pub use config::{BridgeConfig, ConfigValidationError, TlsMode, is_valid_topic_filter};
pub use data::{RawEvent, Reading};
pub use retry::{Backoff, BackoffPolicy};
pub use state::{ConnectionState, ConnectionStatus};

/// 当前 Unix 时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
