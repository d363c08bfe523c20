//! # EMS Storage 模块
//!
//! 接入桥的存储抽象层：
//!
//! 1. **接口抽象层** (`traits.rs`)：`ReadingStore`、`BridgeConfigStore`
//! 2. **数据模型层** (`models.rs`)：配置行、批量写入结果、查询条件
//! 3. **错误处理层** (`error.rs`)：`StorageError`（Unavailable / Rejected）
//! 4. **连接管理层** (`connection.rs`)：数据库连接池
//! 5. **实现层**：
//!    - `postgres/`：sqlx 实现（时序库 `sensor_readings`、配置库 `"MqttConfig"`）
//!    - `in_memory/`：内存实现，带故障注入，用于测试
//!
//! ## 幂等写入
//!
//! 时序表以 `(time, point_name, device_id)` 为自然键，重复写入同一读数不会产生重复行；
//! Batch Writer 因此可以放心重发，无需记录历史。

pub mod connection;
pub mod error;
pub mod in_memory;
pub mod models;
pub mod postgres;
pub mod traits;

pub use connection::*;
pub use error::*;
pub use models::*;
pub use traits::*;

pub use in_memory::{InMemoryBridgeConfigStore, InMemoryReadingStore};
pub use postgres::{BRIDGE_CONFIG_ROW_ID, PgBridgeConfigStore, PgReadingStore};
