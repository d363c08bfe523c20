use domain::Reading;
use ems_storage::{InMemoryReadingStore, ReadingQuery, ReadingStore, StorageErrorKind};

fn reading(ts_ms: i64, point: &str, value: f64) -> Reading {
    let mut reading = Reading::new(ts_ms, point, value);
    reading.device_id = 7;
    reading
}

#[tokio::test]
async fn duplicate_natural_keys_are_ignored() {
    let store = InMemoryReadingStore::new();
    let batch = vec![reading(1000, "temp", 1.0), reading(2000, "temp", 2.0)];

    let first = store.insert_readings(&batch).await.expect("insert");
    assert_eq!(first.written, 2);
    assert_eq!(first.duplicates, 0);

    let second = store.insert_readings(&batch).await.expect("insert");
    assert_eq!(second.written, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(store.len(), 2);

    // 同一时间不同设备不是重复
    let mut other_device = reading(1000, "temp", 1.0);
    other_device.device_id = 8;
    let third = store.insert_readings(&[other_device]).await.expect("insert");
    assert_eq!(third.written, 1);
}

#[tokio::test]
async fn rejected_rows_are_reported_by_index() {
    let store = InMemoryReadingStore::new();
    store.reject_point("bad");
    let batch = vec![
        reading(1000, "temp", 1.0),
        reading(1000, "bad", 1.0),
        reading(2000, "temp", 2.0),
    ];
    let report = store.insert_readings(&batch).await.expect("insert");
    assert_eq!(report.written, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 1);
    assert!(!report.is_complete());
    assert_eq!(report.confirmed() + report.failed.len(), batch.len());
}

#[tokio::test]
async fn rejection_budget_runs_out() {
    let store = InMemoryReadingStore::new();
    store.reject_point_times("flaky", 1);
    let batch = vec![reading(1000, "flaky", 1.0)];
    let first = store.insert_readings(&batch).await.expect("insert");
    assert_eq!(first.failed.len(), 1);
    let second = store.insert_readings(&batch).await.expect("insert");
    assert_eq!(second.written, 1);
}

#[tokio::test]
async fn unavailable_store_confirms_nothing() {
    let store = InMemoryReadingStore::new();
    store.set_unavailable(true);
    let err = store
        .insert_readings(&[reading(1000, "temp", 1.0)])
        .await
        .expect_err("unavailable");
    assert_eq!(err.kind(), StorageErrorKind::Unavailable);
    assert!(store.is_empty());
    assert_eq!(store.insert_calls(), 1);
}

#[tokio::test]
async fn query_returns_descending_time_within_range() {
    let store = InMemoryReadingStore::new();
    let batch: Vec<Reading> = (1..=5)
        .map(|i| reading(i * 1000, "temp", i as f64))
        .chain(std::iter::once(reading(3000, "humidity", 40.0)))
        .collect();
    store.insert_readings(&batch).await.expect("insert");

    let query = ReadingQuery {
        from_ms: Some(2000),
        to_ms: Some(4000),
        ..ReadingQuery::point("temp")
    };
    let rows = store.query_readings(query).await.expect("query");
    let times: Vec<i64> = rows.iter().map(|row| row.ts_ms).collect();
    assert_eq!(times, vec![4000, 3000, 2000]);

    let limited = ReadingQuery {
        limit: 2,
        ..ReadingQuery::point("temp")
    };
    let rows = store.query_readings(limited).await.expect("query");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].ts_ms, 5000);

    let wrong_device = ReadingQuery {
        device_id: Some(99),
        ..ReadingQuery::point("temp")
    };
    assert!(store.query_readings(wrong_device).await.expect("query").is_empty());
}
