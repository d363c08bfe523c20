//! Batch Writer：按大小或时间阈值批量写入时序库，负责写入重试与退避。
//!
//! - 待写缓冲（含积压）由 Writer 独占，Supervisor 只通过接入队列投递
//! - 连接级失败：整批放回队首，尝试次数不变，退避后整批重写
//! - 行级拒绝：只重试失败的行，超过重试上限后丢弃并计数
//! - 积压超过上限：丢弃最旧的行并计数

use crate::PipelineError;
use crate::queue::ReadingReceiver;
use domain::{Backoff, BackoffPolicy, Reading};
use ems_storage::ReadingStore;
use ems_telemetry::TelemetryMetrics;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Writer 参数。
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// 达到该行数立即写入。
    pub batch_size: usize,
    /// 最旧一行等待超过该时长即写入。
    pub max_batch_age: Duration,
    /// 待写行数上限（含失败重试的行）。
    pub max_backlog: usize,
    /// 单行被拒绝后的最大重试次数。
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// 单次写入超时。
    pub storage_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batch_age: Duration::from_millis(1000),
            max_backlog: 10_000,
            max_retries: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10)),
            storage_timeout: Duration::from_secs(10),
        }
    }
}

impl WriterConfig {
    fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.max_backlog < self.batch_size {
            self.max_backlog = self.batch_size;
        }
        self
    }
}

/// 一次 flush 的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub attempted: usize,
    pub written: usize,
    pub duplicates: usize,
    /// 放回缓冲等待重试的行。
    pub retried: usize,
    /// 重试耗尽被丢弃的行。
    pub dropped: usize,
}

#[derive(Debug)]
struct PendingRow {
    reading: Reading,
    /// 被存储拒绝的次数。
    attempts: u32,
    queued_at: Instant,
}

pub struct BatchWriter {
    store: Arc<dyn ReadingStore>,
    receiver: ReadingReceiver,
    config: WriterConfig,
    metrics: Arc<TelemetryMetrics>,
    pending: VecDeque<PendingRow>,
    backoff: Backoff,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        receiver: ReadingReceiver,
        config: WriterConfig,
        metrics: Arc<TelemetryMetrics>,
    ) -> Self {
        let config = config.sanitized();
        let backoff = Backoff::new(config.backoff);
        Self {
            store,
            receiver,
            config,
            metrics,
            pending: VecDeque::new(),
            backoff,
        }
    }

    /// 待写行数（不含接入队列中尚未取出的行）。
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// 主循环：直到收到关停信号，然后尽力写出剩余数据。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "ems.pipeline",
            batch_size = self.config.batch_size,
            max_batch_age_ms = self.config.max_batch_age.as_millis() as u64,
            max_backlog = self.config.max_backlog,
            "batch_writer_started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.pull_from_queue();
            let now = Instant::now();
            if self.flush_due(now) && self.backoff.is_ready(now) {
                let _ = self.flush_once().await;
                continue;
            }
            let wake_at = self.next_wake(now);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.receiver.notified() => {}
                _ = sleep_until_opt(wake_at) => {}
            }
        }
        self.drain().await;
    }

    /// 写出一批（最多 `batch_size` 行），不检查阈值与退避。
    pub async fn flush_once(&mut self) -> Result<FlushOutcome, PipelineError> {
        self.pull_from_queue();
        if self.pending.is_empty() {
            return Ok(FlushOutcome::default());
        }
        let take = self.pending.len().min(self.config.batch_size);
        let batch: Vec<PendingRow> = self.pending.drain(..take).collect();
        let readings: Vec<Reading> = batch.iter().map(|row| row.reading.clone()).collect();

        let started = Instant::now();
        let result =
            tokio::time::timeout(self.config.storage_timeout, self.store.insert_readings(&readings))
                .await;
        self.metrics.record_flush();

        let failed_indices: HashSet<usize> = match result {
            Ok(Ok(report)) => {
                self.metrics
                    .record_write_latency_ms(started.elapsed().as_millis() as u64);
                self.metrics.record_rows_written(report.written as u64);
                self.metrics.record_rows_duplicate(report.duplicates as u64);
                let mut outcome = FlushOutcome {
                    attempted: batch.len(),
                    written: report.written,
                    duplicates: report.duplicates,
                    ..FlushOutcome::default()
                };
                if report.is_complete() {
                    self.backoff.reset();
                    debug!(
                        target: "ems.pipeline",
                        rows = outcome.attempted,
                        written = outcome.written,
                        duplicates = outcome.duplicates,
                        "batch_flushed"
                    );
                    return Ok(outcome);
                }
                for failure in &report.failed {
                    debug!(
                        target: "ems.pipeline",
                        index = failure.index,
                        reason = %failure.reason,
                        "row_rejected"
                    );
                }
                let failed: HashSet<usize> =
                    report.failed.iter().map(|failure| failure.index).collect();
                let (retried, dropped) = self.requeue_rejected(batch, &failed);
                outcome.retried = retried;
                outcome.dropped = dropped;
                let delay = self.backoff.record_failure(Instant::now());
                warn!(
                    target: "ems.pipeline",
                    rows = outcome.attempted,
                    written = outcome.written,
                    duplicates = outcome.duplicates,
                    retried,
                    dropped,
                    retry_in_ms = delay.as_millis() as u64,
                    "batch_partially_rejected"
                );
                return Ok(outcome);
            }
            Ok(Err(err)) if !err.is_unavailable() => {
                // 整条语句被拒绝且没有逐行结果，按全部失败处理
                self.metrics.record_flush_failure();
                warn!(target: "ems.pipeline", error = %err, rows = batch.len(), "batch_rejected");
                (0..batch.len()).collect()
            }
            Ok(Err(err)) => {
                self.hold_batch(batch);
                return Err(self.record_unavailable(PipelineError::Storage(err)));
            }
            Err(_) => {
                self.hold_batch(batch);
                let err = PipelineError::Timeout(self.config.storage_timeout);
                return Err(self.record_unavailable(err));
            }
        };

        let attempted = batch.len();
        let (retried, dropped) = self.requeue_rejected(batch, &failed_indices);
        self.backoff.record_failure(Instant::now());
        Ok(FlushOutcome {
            attempted,
            retried,
            dropped,
            ..FlushOutcome::default()
        })
    }

    fn record_unavailable(&mut self, err: PipelineError) -> PipelineError {
        self.metrics.record_flush_failure();
        let delay = self.backoff.record_failure(Instant::now());
        warn!(
            target: "ems.pipeline",
            error = %err,
            attempt = self.backoff.attempt(),
            pending = self.pending.len(),
            retry_in_ms = delay.as_millis() as u64,
            "flush_failed"
        );
        err
    }

    /// 连接级失败：整批按原顺序放回队首，尝试次数不变。
    fn hold_batch(&mut self, batch: Vec<PendingRow>) {
        for row in batch.into_iter().rev() {
            self.pending.push_front(row);
        }
        self.enforce_backlog();
    }

    /// 被拒绝的行放回队首重试或丢弃，返回 (重试数, 丢弃数)。
    fn requeue_rejected(&mut self, batch: Vec<PendingRow>, failed: &HashSet<usize>) -> (usize, usize) {
        let mut retry = Vec::new();
        let mut dropped = 0usize;
        for (index, mut row) in batch.into_iter().enumerate() {
            if !failed.contains(&index) {
                continue;
            }
            row.attempts += 1;
            if row.attempts > self.config.max_retries {
                dropped += 1;
                warn!(
                    target: "ems.pipeline",
                    point_name = %row.reading.point_name,
                    ts_ms = row.reading.ts_ms,
                    attempts = row.attempts,
                    "row_dropped"
                );
            } else {
                retry.push(row);
            }
        }
        let retried = retry.len();
        for row in retry.into_iter().rev() {
            self.pending.push_front(row);
        }
        self.metrics.record_rows_retried(retried as u64);
        self.metrics.record_rows_dropped(dropped as u64);
        self.enforce_backlog();
        (retried, dropped)
    }

    fn pull_from_queue(&mut self) {
        let now = Instant::now();
        while let Some(reading) = self.receiver.pop() {
            self.pending.push_back(PendingRow {
                reading,
                attempts: 0,
                queued_at: now,
            });
        }
        self.enforce_backlog();
    }

    /// 超过积压上限时丢弃最旧的行。
    fn enforce_backlog(&mut self) {
        let excess = self.pending.len().saturating_sub(self.config.max_backlog);
        if excess == 0 {
            return;
        }
        self.pending.drain(..excess);
        self.metrics.record_backlog_dropped(excess as u64);
        warn!(
            target: "ems.pipeline",
            dropped = excess,
            max_backlog = self.config.max_backlog,
            "backlog_overflow"
        );
    }

    fn flush_due(&self, now: Instant) -> bool {
        if self.pending.len() >= self.config.batch_size {
            return true;
        }
        self.pending
            .front()
            .is_some_and(|row| now.saturating_duration_since(row.queued_at) >= self.config.max_batch_age)
    }

    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let oldest = self.pending.front()?;
        let backoff_deadline = now + self.backoff.remaining(now);
        if self.pending.len() >= self.config.batch_size {
            return Some(backoff_deadline);
        }
        let age_deadline = oldest.queued_at + self.config.max_batch_age;
        Some(age_deadline.max(backoff_deadline))
    }

    /// 关停时尽力写出剩余数据；存储不可用时放弃。
    async fn drain(&mut self) {
        self.pull_from_queue();
        while !self.pending.is_empty() {
            if let Err(err) = self.flush_once().await {
                warn!(
                    target: "ems.pipeline",
                    error = %err,
                    abandoned = self.pending.len(),
                    "shutdown_flush_failed"
                );
                return;
            }
            self.pull_from_queue();
        }
        info!(target: "ems.pipeline", "batch_writer_drained");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
