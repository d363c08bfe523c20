//! Connection Supervisor：broker 订阅生命周期（连接、认证、订阅、保活、断开）。
//!
//! - [`BrokerConnector`] / [`BrokerSession`]：broker 连接抽象，生产实现为 [`MqttConnector`]（rumqttc）
//! - [`ConnectionSupervisor`]：连接状态机，收到的消息交给 Decoder，读数投递到 Batch Writer 队列

mod mqtt;
mod supervisor;

pub use mqtt::{MqttConnector, effective_client_id, qos_from_u8};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, status_channel};

use async_trait::async_trait;
use domain::BridgeConfig;
use std::time::Duration;

/// 连接错误：驱动 Reconnecting + 退避，不会使进程退出。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("tls error: {0}")]
    Tls(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("subscribe rejected: {0}")]
    SubscribeRejected(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("session closed: {0}")]
    Closed(String),
}

/// 一条入站消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// 建立 broker 会话（握手 + 订阅全部 topic 过滤器后才返回）。
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, config: &BridgeConfig) -> Result<Box<dyn BrokerSession>, IngestError>;
}

/// 已连接并完成订阅的会话。
#[async_trait]
pub trait BrokerSession: Send {
    /// 等待下一条消息；返回错误表示传输层断开（网络、broker 关闭、保活超时）。
    async fn next_message(&mut self) -> Result<Inbound, IngestError>;

    /// 取消订阅并断开，尽力而为。
    async fn disconnect(&mut self);
}
