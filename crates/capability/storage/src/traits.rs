//! 存储接口 Trait 定义
//!
//! - ReadingStore：时序读数写入与查询
//! - BridgeConfigStore：配置表读取与连接状态回写
//!
//! 所有接口返回 StorageError，调用方按 [`crate::StorageErrorKind`] 决定重试策略。

use crate::error::StorageError;
use crate::models::{BridgeConfigRecord, InsertReport, ReadingQuery};
use domain::{ConnectionStatus, Reading};

#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// 多行写入，以 (time, point_name, device_id) 为自然键去重。
    ///
    /// 部分行被拒绝时返回 `Ok`，失败行列在 [`InsertReport::failed`]；
    /// 连接级失败返回 `Err`，此时没有任何一行被确认。
    async fn insert_readings(&self, readings: &[Reading]) -> Result<InsertReport, StorageError>;

    /// 按时间倒序查询。
    async fn query_readings(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError>;
}

#[async_trait::async_trait]
pub trait BridgeConfigStore: Send + Sync {
    /// 读取配置行；表中没有配置时返回 `None`。
    async fn fetch_bridge_config(&self) -> Result<Option<BridgeConfigRecord>, StorageError>;

    /// 回写 connectionStatus / lastConnected。
    async fn update_connection_status(&self, status: &ConnectionStatus)
    -> Result<(), StorageError>;
}
