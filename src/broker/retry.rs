//! 有界指数退避
//!
//! 默认 3 次尝试、基数 200ms、倍数 2、上限 2s。发布重试与订阅者重投共用同一策略。

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(200),
            factor: 2,
            cap: Duration::from_secs(2),
        }
    }
}

/// 重试耗尽后的结果：尝试次数与最后一次错误
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration, factor: u32, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            factor: factor.max(1),
            cap,
        }
    }

    /// 第 retry 次重试前的等待时间（retry 从 0 开始）
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    /// 最坏情况下的累计等待
    pub fn max_total_wait(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|r| self.delay_for(r))
            .sum()
    }

    /// 执行 op，遇到可重试错误按策略退避；不可重试错误立即返回
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    if attempt >= self.max_attempts || !retryable(&e) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
        assert_eq!(policy.max_total_wait(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(1), 2, Duration::from_millis(5));
        let calls = AtomicU32::new(0);
        let (value, attempts) = policy
            .retry(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("busy")
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(1), 2, Duration::from_millis(5));
        let err = policy
            .retry(|_| async { Err::<(), _>("closed") }, |e| *e != "closed")
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_error, "closed");
    }
}
