//! 内存存储实现模块
//!
//! 用于测试：行为与 Postgres 实现一致（自然键去重、倒序查询），
//! 并支持故障注入（不可用、按点位拒绝、读取失败）。
//!
//! - ReadingStore: InMemoryReadingStore
//! - BridgeConfigStore: InMemoryBridgeConfigStore

pub mod bridge_config;
pub mod readings;

pub use bridge_config::*;
pub use readings::*;
