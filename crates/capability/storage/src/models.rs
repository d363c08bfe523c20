//! 数据模型
//!
//! - 配置表行：BridgeConfigRow（原始列，可能为 NULL）→ BridgeConfigRecord
//! - 批量写入结果：InsertReport / RowFailure
//! - 时序查询条件：ReadingQuery

use domain::{BridgeConfig, TlsMode};

/// `"MqttConfig"` 表的原始列值。
///
/// NULL 列在转换为 [`BridgeConfigRecord`] 时回落到默认值。
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigRow {
    pub broker: Option<String>,
    pub port: Option<i32>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_enabled: Option<bool>,
    pub tls_insecure: Option<bool>,
    pub ca_cert_path: Option<String>,
    pub topic_patterns: Option<Vec<String>>,
    pub qos: Option<i32>,
    pub enabled: Option<bool>,
    pub connection_status: Option<String>,
    pub last_connected_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
}

/// 配置表中的一行：期望配置 + 接入桥回写的列。
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfigRecord {
    pub config: BridgeConfig,
    pub connection_status: Option<String>,
    pub last_connected_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
}

impl From<BridgeConfigRow> for BridgeConfigRecord {
    fn from(row: BridgeConfigRow) -> Self {
        let defaults = BridgeConfig::default();
        let topic_patterns = row
            .topic_patterns
            .filter(|patterns| !patterns.is_empty())
            .unwrap_or(defaults.topic_patterns);
        let config = BridgeConfig {
            broker: row.broker.unwrap_or_default().trim().to_string(),
            // 超出范围的端口/QoS 交给校验拒绝
            port: row
                .port
                .map(|port| u16::try_from(port).unwrap_or(0))
                .unwrap_or(defaults.port),
            client_id: row.client_id.unwrap_or(defaults.client_id),
            username: row.username.unwrap_or_default(),
            password: row.password.unwrap_or_default(),
            tls_mode: TlsMode::from_flags(
                row.tls_enabled.unwrap_or(false),
                row.tls_insecure.unwrap_or(false),
            ),
            ca_cert_path: row
                .ca_cert_path
                .map(|path| path.trim().to_string())
                .filter(|path| !path.is_empty()),
            topic_patterns,
            qos: row
                .qos
                .map(|qos| u8::try_from(qos).unwrap_or(u8::MAX))
                .unwrap_or(defaults.qos),
            enabled: row.enabled.unwrap_or(true),
        };
        Self {
            config,
            connection_status: row.connection_status,
            last_connected_ms: row.last_connected_ms,
            updated_at_ms: row.updated_at_ms,
        }
    }
}

/// 批量写入中被拒绝的一行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// 在输入切片中的下标。
    pub index: usize,
    pub reason: String,
}

/// 批量写入结果。
///
/// `written + duplicates + failed.len()` 等于输入行数：每一行只落在其中一类。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub written: usize,
    /// 自然键已存在、未新增的行。
    pub duplicates: usize,
    pub failed: Vec<RowFailure>,
}

impl InsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// 已确认（写入或重复）的行数。
    pub fn confirmed(&self) -> usize {
        self.written + self.duplicates
    }
}

/// 时序查询条件（按时间倒序返回）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingQuery {
    pub point_name: String,
    pub device_id: Option<i64>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub limit: i64,
}

impl ReadingQuery {
    pub fn point(point_name: impl Into<String>) -> Self {
        Self {
            point_name: point_name.into(),
            device_id: None,
            from_ms: None,
            to_ms: None,
            limit: 100,
        }
    }

    pub fn matches(&self, ts_ms: i64, point_name: &str, device_id: i64) -> bool {
        point_name == self.point_name
            && self.device_id.is_none_or(|id| id == device_id)
            && self.from_ms.is_none_or(|from| ts_ms >= from)
            && self.to_ms.is_none_or(|to| ts_ms <= to)
    }
}
