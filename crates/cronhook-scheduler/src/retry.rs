//! Retry back-off policies.
//!
//! A policy maps `(attempt, base_ms)` to the delay before the next attempt.
//! `attempt` is the 1-based number of the attempt that just failed. Every
//! policy clamps to its ceiling and uses saturating arithmetic.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cronhook_core::config::{RetryConfig, RetryPolicyKind};
use rand::Rng;

pub trait BackoffPolicy: Send + Sync {
    fn delay_ms(&self, attempt: u32, base_ms: u64) -> u64;
}

/// `base * 2^(attempt-1)`, capped. The default.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    pub ceiling_ms: u64,
}

impl BackoffPolicy for Exponential {
    fn delay_ms(&self, attempt: u32, base_ms: u64) -> u64 {
        let exp = attempt.max(1) - 1;
        let factor = 2u64.checked_pow(exp).unwrap_or(u64::MAX);
        base_ms.saturating_mul(factor).min(self.ceiling_ms)
    }
}

/// `base * attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    pub ceiling_ms: u64,
}

impl BackoffPolicy for Linear {
    fn delay_ms(&self, attempt: u32, base_ms: u64) -> u64 {
        base_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.ceiling_ms)
    }
}

/// Always `base`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    pub ceiling_ms: u64,
}

impl BackoffPolicy for Fixed {
    fn delay_ms(&self, _attempt: u32, base_ms: u64) -> u64 {
        base_ms.min(self.ceiling_ms)
    }
}

/// Shaves a random fraction (up to `ratio`) off another policy's delay.
/// Never exceeds the inner policy, so the inner ceiling still holds.
pub struct Jittered {
    inner: Arc<dyn BackoffPolicy>,
    ratio: f64,
}

impl Jittered {
    pub fn new(inner: Arc<dyn BackoffPolicy>, ratio: f64) -> Self {
        Self {
            inner,
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl BackoffPolicy for Jittered {
    fn delay_ms(&self, attempt: u32, base_ms: u64) -> u64 {
        let delay = self.inner.delay_ms(attempt, base_ms);
        let spread = (delay as f64 * self.ratio) as u64;
        if spread == 0 {
            return delay;
        }
        let cut = rand::thread_rng().gen_range(0..=spread);
        delay.saturating_sub(cut)
    }
}

/// Build the configured policy.
pub fn policy_from_config(config: &RetryConfig) -> Arc<dyn BackoffPolicy> {
    let ceiling_ms = config.ceiling_ms;
    match config.policy {
        RetryPolicyKind::Exponential => Arc::new(Exponential { ceiling_ms }),
        RetryPolicyKind::Linear => Arc::new(Linear { ceiling_ms }),
        RetryPolicyKind::Fixed => Arc::new(Fixed { ceiling_ms }),
        RetryPolicyKind::Jittered => Arc::new(Jittered::new(
            Arc::new(Exponential { ceiling_ms }),
            config.jitter_ratio,
        )),
    }
}

/// When the attempt after `attempt` becomes due.
pub fn next_attempt_at(
    policy: &dyn BackoffPolicy,
    attempt: u32,
    base_ms: u64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let delay = policy.delay_ms(attempt, base_ms);
    let delay = i64::try_from(delay).unwrap_or(i64::MAX);
    Duration::try_milliseconds(delay)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
