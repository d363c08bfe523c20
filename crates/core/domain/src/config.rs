//! Broker 订阅配置（配置表中的单行记录）。

use std::collections::BTreeSet;
use std::fmt;

/// TLS 模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsMode {
    Disabled,
    /// 校验服务端证书（需要 `ca_cert_path`）。
    Secure,
    /// 不校验服务端证书。
    Insecure,
}

impl TlsMode {
    /// 由配置表的 `tlsEnabled` / `tlsInsecure` 两列推导。
    pub fn from_flags(tls_enabled: bool, tls_insecure: bool) -> Self {
        match (tls_enabled, tls_insecure) {
            (false, _) => TlsMode::Disabled,
            (true, true) => TlsMode::Insecure,
            (true, false) => TlsMode::Secure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Disabled => "disabled",
            TlsMode::Secure => "secure",
            TlsMode::Insecure => "insecure",
        }
    }
}

/// 配置校验错误：校验失败的配置不会生效，原配置继续使用。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("broker is required when enabled")]
    MissingBroker,
    #[error("port must be non-zero")]
    InvalidPort,
    #[error("invalid qos: {0}")]
    InvalidQos(u8),
    #[error("caCertPath is required when tls mode is secure")]
    MissingCaCertPath,
    #[error("at least one topic pattern is required when enabled")]
    MissingTopicPatterns,
    #[error("invalid topic filter: {0}")]
    InvalidTopicFilter(String),
}

/// 接入桥配置。
///
/// 同一时刻只有一份处于生效状态；以不可变快照（`Arc<BridgeConfig>`）交给 Supervisor。
#[derive(Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub tls_mode: TlsMode,
    pub ca_cert_path: Option<String>,
    pub topic_patterns: Vec<String>,
    pub qos: u8,
    pub enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: 1883,
            client_id: "ems-bridge".to_string(),
            username: String::new(),
            password: String::new(),
            tls_mode: TlsMode::Disabled,
            ca_cert_path: None,
            topic_patterns: vec!["bacnet/#".to_string()],
            qos: 1,
            enabled: false,
        }
    }
}

impl BridgeConfig {
    /// 校验配置是否可以生效。
    ///
    /// 禁用状态下只校验与连接无关的字段（qos、TLS）。
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.qos > 2 {
            return Err(ConfigValidationError::InvalidQos(self.qos));
        }
        if self.tls_mode == TlsMode::Secure
            && self
                .ca_cert_path
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(ConfigValidationError::MissingCaCertPath);
        }
        if !self.enabled {
            return Ok(());
        }
        if self.broker.trim().is_empty() {
            return Err(ConfigValidationError::MissingBroker);
        }
        if self.port == 0 {
            return Err(ConfigValidationError::InvalidPort);
        }
        if self.topic_patterns.is_empty() {
            return Err(ConfigValidationError::MissingTopicPatterns);
        }
        if let Some(filter) = self
            .topic_patterns
            .iter()
            .find(|filter| !is_valid_topic_filter(filter))
        {
            return Err(ConfigValidationError::InvalidTopicFilter(filter.clone()));
        }
        Ok(())
    }

    /// 仅在 username 非空时发送认证信息。
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// 订阅过滤器集合（与顺序、重复无关）。
    pub fn topic_set(&self) -> BTreeSet<&str> {
        self.topic_patterns.iter().map(String::as_str).collect()
    }

    /// `broker:port`，用于日志。
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("tls_mode", &self.tls_mode)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("topic_patterns", &self.topic_patterns)
            .field("qos", &self.qos)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// 校验 MQTT 订阅过滤器。
///
/// - 不能为空，不能含 NUL
/// - `+` 必须独占一级
/// - `#` 必须独占最后一级
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > 65535 || filter.contains('\0') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return false;
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }
    true
}
