//! 重试策略
//!
//! 有限次数的重试加上可配置的退避间隔，每次尝试可选地受超时约束。
//! 推理和归档提交共用同一个策略对象。

use hippo_core::{HippoError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 退避配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// 固定间隔
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// 指数退避
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// 每次重试的倍数（默认 2.0）
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// 线性退避
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        #[serde(with = "humantime_serde")]
        increment: Duration,

        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// 第 attempt 次失败之后的等待时间（从1开始）
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !(delay_secs < max_delay.as_secs_f64()) {
                    *max_delay
                } else {
                    // 负倍数会产生负值，按不等待处理
                    Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::ZERO)
                }
            }
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = increment
                    .checked_mul(attempt - 1)
                    .and_then(|extra| initial_delay.checked_add(extra))
                    .unwrap_or(*max_delay);
                delay.min(*max_delay)
            }
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最多尝试次数（包括第一次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// 单次尝试的超时
    #[serde(default, with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
}

const fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// 重试耗尽时的结果
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: HippoError,
}

impl RetryPolicy {
    /// 只尝试一次、不等待
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffConfig::Fixed {
                delay: Duration::ZERO,
            },
            attempt_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// 执行操作直到成功或尝试次数耗尽
    ///
    /// 超时计为一次失败。`label` 只用于日志。
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> std::result::Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match self.attempt_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, operation(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(HippoError::Timeout {
                        operation: label.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                },
                None => operation(attempt).await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        "{} 第 {}/{} 次尝试失败: {}，{:?} 后重试",
                        label, attempt, max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffConfig::Fixed {
                delay: Duration::ZERO,
            },
            attempt_timeout: None,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(500), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_with_invalid_multiplier() {
        let negative = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: -2.0,
        };
        assert_eq!(negative.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(negative.delay_for_attempt(3), Duration::from_secs(4));

        let nan = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: f64::NAN,
        };
        assert_eq!(nan.delay_for_attempt(2), Duration::from_secs(60));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(6));
    }

    #[test]
    fn test_backoff_deserialize() {
        let backoff: BackoffConfig =
            serde_json::from_str(r#"{"type":"fixed","delay":"250ms"}"#).unwrap();
        assert_eq!(
            backoff,
            BackoffConfig::Fixed {
                delay: Duration::from_millis(250)
            }
        );
    }

    #[tokio::test]
    async fn test_run_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = instant_retries(3)
            .run("测试", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(HippoError::Network("拒绝连接".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exhausted() {
        let exhausted = instant_retries(2)
            .run("测试", |_| async { Err::<(), _>(HippoError::Network("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert!(matches!(exhausted.last_error, HippoError::Network(_)));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let policy = instant_retries(1).with_timeout(Some(Duration::from_millis(10)));
        let exhausted = policy
            .run("慢操作", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(exhausted.last_error, HippoError::Timeout { .. }));
    }
}
