//! 数据库连接管理
//!
//! 时序库与配置库各自一个连接池。

use crate::error::StorageError;
pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// 建立 Postgres 连接池
///
/// 最大连接数 8；`acquire_timeout` 同时约束首次建连，保证启动等待可以被打断重试。
pub async fn connect_pool(
    database_url: &str,
    acquire_timeout: Duration,
) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}
