//! Supervisor → Writer 的有界接入队列。
//!
//! 写入端从不阻塞：队列满时挤掉最旧的一条并计数，
//! 保证 broker 收包路径（以及 keepalive）不会被存储端反压卡住。

use crossbeam_queue::ArrayQueue;
use domain::Reading;
use ems_telemetry::TelemetryMetrics;
use std::sync::Arc;
use tokio::sync::Notify;

/// 入队结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// 已入队，但挤掉了队列中最旧的一条。
    DroppedOldest,
}

struct Intake {
    queue: ArrayQueue<Reading>,
    notify: Notify,
}

/// 创建容量为 `capacity` 的接入队列。
pub fn intake_queue(
    capacity: usize,
    metrics: Arc<TelemetryMetrics>,
) -> (ReadingSender, ReadingReceiver) {
    let intake = Arc::new(Intake {
        queue: ArrayQueue::new(capacity.max(1)),
        notify: Notify::new(),
    });
    (
        ReadingSender {
            intake: intake.clone(),
            metrics,
        },
        ReadingReceiver { intake },
    )
}

/// 写入端（Supervisor 持有）。
#[derive(Clone)]
pub struct ReadingSender {
    intake: Arc<Intake>,
    metrics: Arc<TelemetryMetrics>,
}

impl ReadingSender {
    pub fn enqueue(&self, reading: Reading) -> EnqueueOutcome {
        let outcome = match self.intake.queue.force_push(reading) {
            None => EnqueueOutcome::Queued,
            Some(_) => {
                self.metrics.record_queue_dropped();
                EnqueueOutcome::DroppedOldest
            }
        };
        self.metrics.record_reading_enqueued();
        self.intake.notify.notify_one();
        outcome
    }

    pub fn len(&self) -> usize {
        self.intake.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intake.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.intake.queue.capacity()
    }
}

/// 读取端（Batch Writer 独占）。
pub struct ReadingReceiver {
    intake: Arc<Intake>,
}

impl ReadingReceiver {
    pub fn pop(&self) -> Option<Reading> {
        self.intake.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.intake.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intake.queue.is_empty()
    }

    /// 等待新的入队通知。
    pub async fn notified(&self) {
        self.intake.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_oldest() {
        let metrics = Arc::new(TelemetryMetrics::new());
        let (sender, receiver) = intake_queue(2, metrics.clone());
        assert_eq!(sender.enqueue(Reading::new(1, "a", 1.0)), EnqueueOutcome::Queued);
        assert_eq!(sender.enqueue(Reading::new(2, "b", 2.0)), EnqueueOutcome::Queued);
        assert_eq!(
            sender.enqueue(Reading::new(3, "c", 3.0)),
            EnqueueOutcome::DroppedOldest
        );

        let names: Vec<String> = std::iter::from_fn(|| receiver.pop())
            .map(|reading| reading.point_name)
            .collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.readings_enqueued, 3);
        assert_eq!(snapshot.queue_dropped, 1);
    }
}
