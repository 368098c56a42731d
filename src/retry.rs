//! リトライ / 指数バックオフ
//!
//! 一時的な失敗 (`ScraperError::is_retryable`) のみ再試行し、
//! 致命的な失敗は試行回数を消費せずにそのまま返す。

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ScraperError;

/// 既定の最大試行回数
pub const MAX_ATTEMPTS: u32 = 3;
/// 既定の初回待機（ミリ秒）
pub const INITIAL_BACKOFF_MS: u64 = 1000;
/// 待機時間の上限（ミリ秒）
pub const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `attempt` 回目 (1始まり) が失敗した後の待機時間: base × factor^(attempt−1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// 操作をリトライ付きで実行する
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ScraperError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScraperError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!(
                            "{} failed after {} attempts: {}",
                            operation, attempt, e
                        );
                        return Err(ScraperError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: Box::new(e),
                        });
                    }
                    let backoff = self.delay_for(attempt);
                    warn!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        operation, attempt, backoff, e
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `RetryPolicy::run` の関数形式
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    backoff_factor: f64,
    op: F,
) -> Result<T, ScraperError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScraperError>>,
{
    RetryPolicy::new(max_attempts, base_delay, backoff_factor)
        .run(operation, op)
        .await
}
