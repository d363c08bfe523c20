//! Batch Writer 与接入队列。
//!
//! 数据流：Supervisor → [`ReadingSender::enqueue`]（有界、不阻塞）→ [`BatchWriter`]
//! （按大小/时间阈值 flush）→ [`ems_storage::ReadingStore`]。

mod queue;
mod writer;

pub use queue::{EnqueueOutcome, ReadingReceiver, ReadingSender, intake_queue};
pub use writer::{BatchWriter, FlushOutcome, WriterConfig};

use ems_storage::StorageError;
use std::time::Duration;

/// 写入错误：只在 Writer 内部处理（退避重试），不会向上传播。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("storage timed out after {0:?}")]
    Timeout(Duration),
}
