use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl From<&config::RetryConfig> for RetryPolicy {
    fn from(config: &config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::exponential(
                Duration::from_millis(config.initial_delay_ms),
                Duration::from_millis(config.max_delay_ms),
            ),
        }
    }
}

/// 按策略重试，`retryable` 返回 false 的错误立即返回
pub async fn retry_async<F, Fut, T, E, P>(
    what: &str,
    policy: &RetryPolicy,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts || !retryable(&e) {
                    return Err(e);
                }
                let delay = policy.backoff.delay_at(attempt);
                tracing::warn!(
                    target_name = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "连接失败，稍后重试"
                );
                sleep(delay).await;
            }
        }
    }
}
