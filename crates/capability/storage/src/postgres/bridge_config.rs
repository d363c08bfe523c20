//! Postgres 配置表读取与连接状态回写
//!
//! 配置库由外部设置页面维护，接入桥只读期望配置、只写状态列。

use crate::error::StorageError;
use crate::models::{BridgeConfigRecord, BridgeConfigRow};
use crate::traits::BridgeConfigStore;
use domain::ConnectionStatus;
use sqlx::{PgPool, Row};

/// 配置行主键。
pub const BRIDGE_CONFIG_ROW_ID: i32 = 1;

pub struct PgBridgeConfigStore {
    pub pool: PgPool,
}

impl PgBridgeConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BridgeConfigStore for PgBridgeConfigStore {
    async fn fetch_bridge_config(&self) -> Result<Option<BridgeConfigRecord>, StorageError> {
        // 单条语句读取整行，保证不会拿到半更新的配置
        let row = sqlx::query(
            "select broker, port, \"clientId\", username, password, \
             \"tlsEnabled\", \"tlsInsecure\", \"caCertPath\", \
             \"topicPatterns\", qos, enabled, \"connectionStatus\", \
             (extract(epoch from \"lastConnected\") * 1000)::bigint as last_connected_ms, \
             (extract(epoch from \"updatedAt\") * 1000)::bigint as updated_at_ms \
             from \"MqttConfig\" where id = $1 limit 1",
        )
        .bind(BRIDGE_CONFIG_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = BridgeConfigRow {
            broker: row.try_get("broker")?,
            port: row.try_get("port")?,
            client_id: row.try_get("clientId")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            tls_enabled: row.try_get("tlsEnabled")?,
            tls_insecure: row.try_get("tlsInsecure")?,
            ca_cert_path: row.try_get("caCertPath")?,
            topic_patterns: row.try_get("topicPatterns")?,
            qos: row.try_get("qos")?,
            enabled: row.try_get("enabled")?,
            connection_status: row.try_get("connectionStatus")?,
            last_connected_ms: row.try_get("last_connected_ms")?,
            updated_at_ms: row.try_get("updated_at_ms")?,
        };
        Ok(Some(row.into()))
    }

    async fn update_connection_status(
        &self,
        status: &ConnectionStatus,
    ) -> Result<(), StorageError> {
        // 状态通道会合并快速变化，lastConnected 随每次回写一并刷新且不回退
        sqlx::query(
            "update \"MqttConfig\" \
             set \"connectionStatus\" = $1, \
             \"lastConnected\" = case \
               when $2::bigint is null then \"lastConnected\" \
               else greatest(\"lastConnected\", to_timestamp($2::bigint / 1000.0::float8)) \
             end, \
             \"updatedAt\" = now() \
             where id = $3",
        )
        .bind(status.state.as_str())
        .bind(status.last_connected_ms)
        .bind(BRIDGE_CONFIG_ROW_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
