//! Postgres 时序读数写入与查询

use crate::error::StorageError;
use crate::models::{InsertReport, ReadingQuery, RowFailure};
use crate::traits::ReadingStore;
use domain::Reading;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// 每条 insert 语句的最大行数（18 列 × 2000 行，低于 Postgres 65535 个绑定参数上限）。
const MAX_ROWS_PER_STATEMENT: usize = 2000;

const INSERT_COLUMNS: &str = "insert into sensor_readings (\
     time, site_id, equipment_type, equipment_id, \
     device_id, device_name, device_ip, \
     object_type, object_instance, \
     point_id, point_name, haystack_name, dis, \
     value, units, quality, \
     poll_duration, poll_cycle) ";

const ON_CONFLICT: &str = " on conflict (time, point_name, device_id) do nothing";

pub struct PgReadingStore {
    pub pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 单条 insert 写入多行，返回实际新增行数。
    async fn insert_chunk(&self, readings: &[Reading]) -> Result<u64, StorageError> {
        let mut builder = QueryBuilder::<Postgres>::new(INSERT_COLUMNS);
        builder.push_values(readings, |mut row, reading| {
            row.push("to_timestamp(")
                .push_bind_unseparated(reading.ts_ms as f64)
                .push_unseparated(" / 1000.0)")
                .push_bind(reading.site_id.as_deref())
                .push_bind(reading.equipment_type.as_deref())
                .push_bind(reading.equipment_id.as_deref())
                .push_bind(reading.device_id)
                .push_bind(reading.device_name.as_str())
                .push_bind(reading.device_ip.as_str())
                .push_bind(reading.object_type.as_str())
                .push_bind(reading.object_instance)
                .push_bind(reading.point_id)
                .push_bind(reading.point_name.as_str())
                .push_bind(reading.haystack_name.as_deref())
                .push_bind(reading.display_name.as_deref())
                .push_bind(reading.value)
                .push_bind(reading.units.as_str())
                .push_bind(reading.quality.as_str())
                .push_bind(reading.poll_duration)
                .push_bind(reading.poll_cycle);
        });
        builder.push(ON_CONFLICT);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// 多行语句被拒绝后逐行重写，定位具体失败的行。
    async fn insert_rows_individually(
        &self,
        readings: &[Reading],
        offset: usize,
        report: &mut InsertReport,
    ) -> Result<(), StorageError> {
        for (index, reading) in readings.iter().enumerate() {
            match self.insert_chunk(std::slice::from_ref(reading)).await {
                Ok(1) => report.written += 1,
                Ok(_) => report.duplicates += 1,
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => report.failed.push(RowFailure {
                    index: offset + index,
                    reason: err.message().to_string(),
                }),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReadingStore for PgReadingStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<InsertReport, StorageError> {
        let mut report = InsertReport::default();
        for (chunk_index, chunk) in readings.chunks(MAX_ROWS_PER_STATEMENT).enumerate() {
            let offset = chunk_index * MAX_ROWS_PER_STATEMENT;
            match self.insert_chunk(chunk).await {
                Ok(inserted) => {
                    let inserted = inserted as usize;
                    report.written += inserted;
                    report.duplicates += chunk.len().saturating_sub(inserted);
                }
                Err(err) if err.is_unavailable() => return Err(err),
                Err(_) => self.insert_rows_individually(chunk, offset, &mut report).await?,
            }
        }
        Ok(report)
    }

    async fn query_readings(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        if query.limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "select (extract(epoch from time) * 1000)::bigint as ts_ms, \
             site_id, equipment_type, equipment_id, \
             device_id::bigint as device_id, device_name, device_ip, \
             object_type, object_instance::bigint as object_instance, \
             point_id::bigint as point_id, point_name, haystack_name, dis, \
             value::float8 as value, units, quality, \
             poll_duration::float8 as poll_duration, poll_cycle::bigint as poll_cycle \
             from sensor_readings \
             where point_name = $1 \
             and ($2::bigint is null or device_id = $2) \
             and ($3::float8 is null or time >= to_timestamp($3 / 1000.0)) \
             and ($4::float8 is null or time <= to_timestamp($4 / 1000.0)) \
             order by time desc \
             limit $5",
        )
        .bind(&query.point_name)
        .bind(query.device_id)
        .bind(query.from_ms.map(|ms| ms as f64))
        .bind(query.to_ms.map(|ms| ms as f64))
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(Reading {
                ts_ms: row.try_get("ts_ms")?,
                point_name: row.try_get("point_name")?,
                display_name: row.try_get("dis")?,
                value: row.try_get("value")?,
                units: row
                    .try_get::<Option<String>, _>("units")?
                    .unwrap_or_default(),
                quality: row
                    .try_get::<Option<String>, _>("quality")?
                    .unwrap_or_else(|| Reading::DEFAULT_QUALITY.to_string()),
                device_id: row.try_get::<Option<i64>, _>("device_id")?.unwrap_or(0),
                device_name: row
                    .try_get::<Option<String>, _>("device_name")?
                    .unwrap_or_default(),
                device_ip: row
                    .try_get::<Option<String>, _>("device_ip")?
                    .unwrap_or_default(),
                object_type: row
                    .try_get::<Option<String>, _>("object_type")?
                    .unwrap_or_default(),
                object_instance: row
                    .try_get::<Option<i64>, _>("object_instance")?
                    .unwrap_or(0),
                site_id: row.try_get("site_id")?,
                equipment_type: row.try_get("equipment_type")?,
                equipment_id: row.try_get("equipment_id")?,
                point_id: row.try_get("point_id")?,
                haystack_name: row.try_get("haystack_name")?,
                poll_duration: row.try_get("poll_duration")?,
                poll_cycle: row.try_get("poll_cycle")?,
            });
        }
        Ok(items)
    }
}
