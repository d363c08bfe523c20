//! 显式退避状态（重试次数 + 下次可执行时间）。
//!
//! 重连与写入重试都由调用方持有一个 `Backoff`，在循环里查询是否到期，
//! 不使用递归重试，便于取消与测试。

use rand_core::{OsRng, RngCore};
use std::time::Duration;
use tokio::time::Instant;

/// 指数退避参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// 抖动比例（0..=1）：实际延迟落在 `[base * (1 - jitter), base]`。
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// 第 `attempt` 次失败（从 1 开始）后的基础延迟，不含抖动。
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(20);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

/// 退避状态。
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    next_eligible_at: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next_eligible_at: None,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// 连续失败次数。
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.next_eligible_at
    }

    /// 记录一次失败，返回本次需要等待的延迟。
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = jittered(self.policy.base_delay(self.attempt), self.policy.jitter);
        self.next_eligible_at = Some(now + delay);
        delay
    }

    /// 成功后清零。
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_eligible_at = None;
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_eligible_at.is_none_or(|at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_eligible_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let unit = OsRng.next_u64() as f64 / u64::MAX as f64;
    delay.mul_f64(1.0 - jitter * unit)
}
