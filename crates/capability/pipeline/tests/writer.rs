use async_trait::async_trait;
use domain::{BackoffPolicy, Reading};
use ems_pipeline::{BatchWriter, PipelineError, ReadingSender, WriterConfig, intake_queue};
use ems_storage::{InMemoryReadingStore, InsertReport, ReadingQuery, ReadingStore, StorageError};
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn config() -> WriterConfig {
    WriterConfig {
        batch_size: 100,
        max_batch_age: Duration::from_secs(1),
        max_backlog: 1000,
        max_retries: 3,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100))
            .with_jitter(0.0),
        storage_timeout: Duration::from_secs(5),
    }
}

fn setup(
    config: WriterConfig,
) -> (
    Arc<InMemoryReadingStore>,
    ReadingSender,
    BatchWriter,
    Arc<TelemetryMetrics>,
) {
    let store = Arc::new(InMemoryReadingStore::new());
    let metrics = Arc::new(TelemetryMetrics::new());
    let (sender, receiver) = intake_queue(1000, metrics.clone());
    let writer = BatchWriter::new(
        store.clone() as Arc<dyn ReadingStore>,
        receiver,
        config,
        metrics.clone(),
    );
    (store, sender, writer, metrics)
}

fn reading(ts_ms: i64, point: &str) -> Reading {
    Reading::new(ts_ms, point, ts_ms as f64)
}

#[tokio::test]
async fn rejected_rows_are_retried_then_dropped() {
    let (store, sender, mut writer, metrics) = setup(config());
    for point in ["bad-0", "bad-1", "bad-2"] {
        store.reject_point(point);
    }
    for i in 0..47 {
        sender.enqueue(reading(1000 + i, "temp"));
    }
    for point in ["bad-0", "bad-1", "bad-2"] {
        sender.enqueue(reading(5000, point));
    }

    let first = writer.flush_once().await.expect("flush");
    assert_eq!(first.attempted, 50);
    assert_eq!(first.written, 47);
    assert_eq!(first.retried, 3);
    assert_eq!(first.dropped, 0);
    assert_eq!(writer.pending_len(), 3);

    for _ in 0..2 {
        let retry = writer.flush_once().await.expect("flush");
        assert_eq!(retry.attempted, 3);
        assert_eq!(retry.retried, 3);
    }
    let last = writer.flush_once().await.expect("flush");
    assert_eq!(last.retried, 0);
    assert_eq!(last.dropped, 3);
    assert_eq!(writer.pending_len(), 0);

    assert_eq!(store.len(), 47);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.rows_written, 47);
    assert_eq!(snapshot.rows_retried, 9);
    assert_eq!(snapshot.rows_dropped, 3);
}

#[tokio::test]
async fn retried_rows_are_written_once_accepted() {
    let (store, sender, mut writer, metrics) = setup(config());
    store.reject_point_times("flaky", 2);
    sender.enqueue(reading(1000, "temp"));
    sender.enqueue(reading(1000, "flaky"));

    assert_eq!(writer.flush_once().await.expect("flush").retried, 1);
    assert_eq!(writer.backoff().attempt(), 1);
    assert_eq!(writer.flush_once().await.expect("flush").retried, 1);
    let third = writer.flush_once().await.expect("flush");
    assert_eq!(third.written, 1);
    assert_eq!(writer.backoff().attempt(), 0);

    assert_eq!(store.len(), 2);
    assert_eq!(metrics.snapshot().rows_dropped, 0);
}

#[tokio::test]
async fn unavailable_store_holds_whole_batch() {
    let (store, sender, mut writer, metrics) = setup(config());
    store.set_unavailable(true);
    for i in 0..10 {
        sender.enqueue(reading(i, "temp"));
    }

    let err = writer.flush_once().await.expect_err("unavailable");
    assert!(matches!(err, PipelineError::Storage(_)));
    assert_eq!(writer.pending_len(), 10);
    assert_eq!(writer.backoff().attempt(), 1);
    assert_eq!(metrics.snapshot().flush_failures, 1);

    store.set_unavailable(false);
    let outcome = writer.flush_once().await.expect("flush");
    assert_eq!(outcome.written, 10);
    assert_eq!(writer.pending_len(), 0);
    // 原顺序写入
    let times: Vec<i64> = store.readings().iter().map(|r| r.ts_ms).collect();
    assert_eq!(times, (0..10).collect::<Vec<_>>());
    assert_eq!(metrics.snapshot().rows_dropped, 0);
}

#[tokio::test]
async fn backlog_stays_bounded_during_outage() {
    let config = WriterConfig {
        batch_size: 5,
        max_backlog: 10,
        ..config()
    };
    let (store, sender, mut writer, metrics) = setup(config);
    store.set_unavailable(true);

    let mut previous_dropped = 0;
    for round in 0..3 {
        for i in 0..10 {
            sender.enqueue(reading(round * 100 + i, "temp"));
        }
        let _ = writer.flush_once().await;
        assert!(writer.pending_len() <= 10);
        let dropped = metrics.snapshot().backlog_dropped;
        assert!(dropped >= previous_dropped);
        previous_dropped = dropped;
    }
    assert_eq!(previous_dropped, 20);

    // 保留的是最新的 10 条
    store.set_unavailable(false);
    writer.flush_once().await.expect("flush");
    writer.flush_once().await.expect("flush");
    let times: Vec<i64> = store.readings().iter().map(|r| r.ts_ms).collect();
    assert_eq!(times, (200..210).collect::<Vec<_>>());
}

#[tokio::test]
async fn duplicate_resend_is_not_a_new_row() {
    let (store, sender, mut writer, metrics) = setup(config());
    sender.enqueue(reading(1000, "temp"));
    writer.flush_once().await.expect("flush");
    sender.enqueue(reading(1000, "temp"));
    let outcome = writer.flush_once().await.expect("flush");
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(store.len(), 1);
    assert_eq!(metrics.snapshot().rows_duplicate, 1);
}

#[tokio::test(start_paused = true)]
async fn run_flushes_on_age_and_drains_on_shutdown() {
    let (store, sender, writer, _metrics) = setup(config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(writer.run(shutdown_rx));

    sender.enqueue(reading(1, "temp"));
    sender.enqueue(reading(2, "temp"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.len(), 0);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(store.len(), 2);

    sender.enqueue(reading(3, "temp"));
    shutdown_tx.send(true).expect("shutdown");
    handle.await.expect("writer task");
    assert_eq!(store.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn run_flushes_when_batch_is_full() {
    let config = WriterConfig {
        batch_size: 3,
        max_batch_age: Duration::from_secs(60),
        ..config()
    };
    let (store, sender, writer, _metrics) = setup(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(writer.run(shutdown_rx));

    for i in 0..3 {
        sender.enqueue(reading(i, "temp"));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.len(), 3);

    shutdown_tx.send(true).expect("shutdown");
    handle.await.expect("writer task");
}

/// 写入永远不返回的存储。
struct StalledStore;

#[async_trait]
impl ReadingStore for StalledStore {
    async fn insert_readings(&self, _readings: &[Reading]) -> Result<InsertReport, StorageError> {
        std::future::pending().await
    }

    async fn query_readings(&self, _query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_store_times_out_and_keeps_batch() {
    let metrics = Arc::new(TelemetryMetrics::new());
    let (sender, receiver) = intake_queue(100, metrics.clone());
    let mut writer = BatchWriter::new(Arc::new(StalledStore), receiver, config(), metrics.clone());
    for i in 0..4 {
        sender.enqueue(reading(i, "temp"));
    }

    let err = writer.flush_once().await.expect_err("timeout");
    assert!(matches!(err, PipelineError::Timeout(timeout) if timeout == Duration::from_secs(5)));
    assert_eq!(writer.pending_len(), 4);
    assert_eq!(writer.backoff().attempt(), 1);
    assert!(!writer.backoff().is_ready(tokio::time::Instant::now()));
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.flush_failures, 1);
    assert_eq!(snapshot.rows_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drain_gives_up_when_store_is_unavailable() {
    let (store, sender, writer, metrics) = setup(config());
    store.set_unavailable(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(writer.run(shutdown_rx));

    for i in 0..3 {
        sender.enqueue(reading(i, "temp"));
    }
    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("drain returns")
        .expect("writer task");
    assert_eq!(store.len(), 0);
    assert_eq!(store.insert_calls(), 1);
    assert_eq!(metrics.snapshot().flush_failures, 1);
}
