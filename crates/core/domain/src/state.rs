//! 连接状态（由 Connection Supervisor 独占维护）。

use std::fmt;

/// Broker 连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disabled,
}

impl ConnectionState {
    /// 回写到配置表 `connectionStatus` 列的取值。
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对外上报的连接状态快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// 进入该状态的时间。
    pub changed_at_ms: i64,
    /// 最近一次进入 `Connected` 的时间。
    pub last_connected_ms: Option<i64>,
}

impl ConnectionStatus {
    pub fn initial(now_ms: i64) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            changed_at_ms: now_ms,
            last_connected_ms: None,
        }
    }
}
