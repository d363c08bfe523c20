//! MQTT → 时序库接入桥：Coordinator 与状态 HTTP 服务。

pub mod bridge;
pub mod status;

pub use bridge::{BridgeDeps, BridgeError, BridgeSettings, Coordinator};
pub use status::{StatusBody, StatusState, router};
