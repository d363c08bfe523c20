//! 配置表内存实现

use crate::error::StorageError;
use crate::models::BridgeConfigRecord;
use crate::traits::BridgeConfigStore;
use domain::{BridgeConfig, ConnectionStatus};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 配置表内存存储
#[derive(Default)]
pub struct InMemoryBridgeConfigStore {
    record: RwLock<Option<BridgeConfigRecord>>,
    statuses: RwLock<Vec<ConnectionStatus>>,
    fetch_fails: AtomicBool,
    status_write_fails: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl InMemoryBridgeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let store = Self::new();
        store.set_config(config);
        store
    }

    /// 模拟外部设置页面修改配置行（保留状态列）。
    pub fn set_config(&self, config: BridgeConfig) {
        if let Ok(mut record) = self.record.write() {
            match record.as_mut() {
                Some(existing) => existing.config = config,
                None => {
                    *record = Some(BridgeConfigRecord {
                        config,
                        connection_status: None,
                        last_connected_ms: None,
                        updated_at_ms: None,
                    })
                }
            }
        }
    }

    pub fn clear_config(&self) {
        if let Ok(mut record) = self.record.write() {
            *record = None;
        }
    }

    pub fn set_fetch_failure(&self, fails: bool) {
        self.fetch_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_status_write_failure(&self, fails: bool) {
        self.status_write_fails.store(fails, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// 全部状态回写记录（按时间顺序）。
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses
            .read()
            .map(|statuses| statuses.clone())
            .unwrap_or_default()
    }

    pub fn record(&self) -> Option<BridgeConfigRecord> {
        self.record.read().ok().and_then(|record| record.clone())
    }
}

#[async_trait::async_trait]
impl BridgeConfigStore for InMemoryBridgeConfigStore {
    async fn fetch_bridge_config(&self) -> Result<Option<BridgeConfigRecord>, StorageError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("connection refused"));
        }
        let record = self
            .record
            .read()
            .map_err(|_| StorageError::unavailable("lock failed"))?;
        Ok(record.clone())
    }

    async fn update_connection_status(
        &self,
        status: &ConnectionStatus,
    ) -> Result<(), StorageError> {
        if self.status_write_fails.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("connection refused"));
        }
        if let Ok(mut record) = self.record.write() {
            if let Some(record) = record.as_mut() {
                record.connection_status = Some(status.state.as_str().to_string());
                record.updated_at_ms = Some(status.changed_at_ms);
                if let Some(connected_ms) = status.last_connected_ms {
                    record.last_connected_ms = record.last_connected_ms.max(Some(connected_ms));
                }
            }
        }
        self.statuses
            .write()
            .map_err(|_| StorageError::unavailable("lock failed"))?
            .push(*status);
        Ok(())
    }
}
