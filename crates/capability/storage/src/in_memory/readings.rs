//! 时序读数内存实现

use crate::error::StorageError;
use crate::models::{InsertReport, ReadingQuery, RowFailure};
use crate::traits::ReadingStore;
use domain::Reading;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type NaturalKey = (i64, String, i64);

#[derive(Default)]
struct Inner {
    rows: Vec<Reading>,
    keys: HashSet<NaturalKey>,
}

/// 时序读数内存存储
#[derive(Default)]
pub struct InMemoryReadingStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    /// 点位名 → 剩余拒绝次数（`None` 表示一直拒绝）。
    rejected_points: RwLock<HashMap<String, Option<usize>>>,
    insert_calls: AtomicUsize,
}

impl InMemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟数据库不可达。
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 一直拒绝该点位的行（模拟约束冲突）。
    pub fn reject_point(&self, point_name: impl Into<String>) {
        if let Ok(mut points) = self.rejected_points.write() {
            points.insert(point_name.into(), None);
        }
    }

    /// 拒绝该点位接下来的 `times` 次写入。
    pub fn reject_point_times(&self, point_name: impl Into<String>, times: usize) {
        if let Ok(mut points) = self.rejected_points.write() {
            points.insert(point_name.into(), Some(times));
        }
    }

    pub fn allow_point(&self, point_name: &str) {
        if let Ok(mut points) = self.rejected_points.write() {
            points.remove(point_name);
        }
    }

    /// 已写入的行数（用于测试）。
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按写入顺序返回全部行（用于测试）。
    pub fn readings(&self) -> Vec<Reading> {
        self.inner
            .read()
            .map(|inner| inner.rows.clone())
            .unwrap_or_default()
    }

    /// `insert_readings` 调用次数（包括失败的调用）。
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn take_rejection(&self, point_name: &str) -> bool {
        let Ok(mut points) = self.rejected_points.write() else {
            return false;
        };
        match points.get_mut(point_name) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                points.remove(point_name);
                false
            }
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl ReadingStore for InMemoryReadingStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<InsertReport, StorageError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("connection refused"));
        }
        let mut report = InsertReport::default();
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StorageError::unavailable("lock failed"))?;
        for (index, reading) in readings.iter().enumerate() {
            if self.take_rejection(&reading.point_name) {
                report.failed.push(RowFailure {
                    index,
                    reason: format!("constraint violation for point {}", reading.point_name),
                });
                continue;
            }
            let key = (reading.ts_ms, reading.point_name.clone(), reading.device_id);
            if inner.keys.insert(key) {
                inner.rows.push(reading.clone());
                report.written += 1;
            } else {
                report.duplicates += 1;
            }
        }
        Ok(report)
    }

    async fn query_readings(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("connection refused"));
        }
        let limit = query.limit.max(0) as usize;
        let inner = self
            .inner
            .read()
            .map_err(|_| StorageError::unavailable("lock failed"))?;
        let mut selected: Vec<Reading> = inner
            .rows
            .iter()
            .filter(|reading| query.matches(reading.ts_ms, &reading.point_name, reading.device_id))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.ts_ms.cmp(&a.ts_ms));
        selected.truncate(limit);
        Ok(selected)
    }
}
