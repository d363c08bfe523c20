//! # PostgreSQL 存储实现模块
//!
//! - **ReadingStore** (`readings.rs`)：`sensor_readings` 时序表（TimescaleDB hypertable）
//! - **BridgeConfigStore** (`bridge_config.rs`)：配置库 `"MqttConfig"` 表（id = 1 的单行）
//!
//! ## 数据库模式要求
//!
//! - `sensor_readings` 需要 `(time, point_name, device_id)` 唯一约束，写入依赖
//!   `on conflict ... do nothing` 实现幂等
//! - 分区、压缩、保留策略属于一次性外部初始化，运行期不修改
//!
//! 所有 SQL 使用参数绑定。

pub mod bridge_config;
pub mod readings;

pub use bridge_config::*;
pub use readings::*;
