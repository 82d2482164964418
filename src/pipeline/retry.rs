//! 重试策略
//!
//! 对单条记录最多调用 `max_retries` 次分类客户端，两次调用之间按指数退避
//! 等待，最后一次失败后不再等待。结果总是一个 [`Outcome`]，从不返回错误。

use std::time::Duration;

use tracing::{debug, warn};

use super::client::{ClassificationClient, ClientError};
use crate::model::{Label, RecordId};
use crate::util::config::types::PipelineConfig;
use crate::util::logging::standards::events;

/// 单条记录的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { label: Label, attempts: u32 },
    Exhausted { last_error: ClientError, attempts: u32 },
}

impl Outcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts, .. } | Outcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    rate_limit_multiplier: u32,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        rate_limit_multiplier: u32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            rate_limit_multiplier: rate_limit_multiplier.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.backoff.base_ms),
            Duration::from_millis(config.backoff.max_ms),
            config.backoff.rate_limit_multiplier,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 `attempt` 次（从1开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32, error: &ClientError) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let exp = self.base_delay.saturating_mul(1u32 << shift);

        let delay = match error {
            ClientError::RateLimited { retry_after } => {
                let scaled = exp.saturating_mul(self.rate_limit_multiplier);
                retry_after.map_or(scaled, |hint| scaled.max(hint))
            }
            _ => exp,
        };
        delay.min(self.max_delay)
    }

    /// 对一条记录执行带退避的分类
    pub async fn attempt(&self, client: &ClassificationClient, id: RecordId, text: &str) -> Outcome {
        let mut attempt = 1;
        loop {
            match client.classify(text).await {
                Ok(label) => {
                    return Outcome::Success {
                        label,
                        attempts: attempt,
                    }
                }
                Err(error) if attempt >= self.max_attempts => {
                    warn!(
                        event = events::RECORD_RETRY,
                        record = %id,
                        attempts = attempt,
                        error_kind = error.kind(),
                        error = %error,
                        "重试次数已用尽"
                    );
                    return Outcome::Exhausted {
                        last_error: error,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    let delay = self.delay_for(attempt, &error);
                    debug!(
                        event = events::RECORD_RETRY,
                        record = %id,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = error.kind(),
                        "分类失败，等待后重试"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::client::{tests::taxonomy, Oracle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// 前 `failures` 次返回给定错误，之后返回固定回答
    struct FlakyOracle {
        failures: u32,
        error: ClientError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Oracle for FlakyOracle {
        async fn ask(&self, _text: &str) -> Result<String, ClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok("Arts / Music".to_string())
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            4,
        )
    }

    fn setup(failures: u32, error: ClientError) -> (Arc<FlakyOracle>, ClassificationClient) {
        let oracle = Arc::new(FlakyOracle {
            failures,
            error,
            calls: AtomicU32::new(0),
        });
        let client = ClassificationClient::new(oracle.clone(), taxonomy(), Duration::from_secs(5));
        (oracle, client)
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy(5);
        let unavailable = ClientError::Unavailable("down".to_string());
        assert_eq!(p.delay_for(1, &unavailable), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, &unavailable), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, &unavailable), Duration::from_millis(400));
        assert_eq!(p.delay_for(5, &unavailable), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(64, &unavailable), Duration::from_millis(1_000));
    }

    #[test]
    fn test_rate_limit_backoff() {
        let p = policy(5);
        let no_hint = ClientError::RateLimited { retry_after: None };
        assert_eq!(p.delay_for(1, &no_hint), Duration::from_millis(400));
        assert_eq!(p.delay_for(2, &no_hint), Duration::from_millis(800));
        assert_eq!(p.delay_for(3, &no_hint), Duration::from_millis(1_000));

        let hinted = ClientError::RateLimited {
            retry_after: Some(Duration::from_millis(700)),
        };
        assert_eq!(p.delay_for(1, &hinted), Duration::from_millis(700));
        let long_hint = ClientError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(p.delay_for(1, &long_hint), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let (oracle, client) = setup(2, ClientError::Timeout);
        let outcome = policy(3).attempt(&client, RecordId(0), "piano").await;
        assert_eq!(
            outcome,
            Outcome::Success {
                label: Label::classified("Arts", Some("Music")),
                attempts: 3
            }
        );
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_is_bounded() {
        let (oracle, client) = setup(u32::MAX, ClientError::Unavailable("down".to_string()));
        let outcome = policy(3).attempt(&client, RecordId(7), "piano").await;
        assert_eq!(
            outcome,
            Outcome::Exhausted {
                last_error: ClientError::Unavailable("down".to_string()),
                attempts: 3
            }
        );
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_last_attempt() {
        let (_, client) = setup(u32::MAX, ClientError::Timeout);
        let started = tokio::time::Instant::now();
        let outcome = policy(2).attempt(&client, RecordId(1), "piano").await;
        assert_eq!(outcome.attempts(), 2);
        // 只有第1次失败后等待了 100ms
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        assert_eq!(policy(0).max_attempts(), 1);
    }
}
