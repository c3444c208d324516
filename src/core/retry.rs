use std::future::Future;
/// 瞬时错误重试
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::core::types::Result;

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 指数退避因子
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 是否添加抖动
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// 计算第attempt次重试前的等待时间
    /// 同步计算，随机数生成器不跨越await点
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let mut delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        // 抖动，避免多个任务的重试节奏雷同
        if self.jitter && delay_ms > 0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            delay_ms += rng.gen_range(0..=delay_ms / 4);
        }

        Duration::from_millis(delay_ms)
    }
}

/// 执行带重试的操作，只对瞬时错误重试
/// 重试预算耗尽后返回最后一次错误，由调用方决定是否跳过本轮
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    log::info!("✅ 操作 {} 在第{}次尝试后成功", operation_name, attempt + 1);
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_transient() || attempt >= config.max_retries {
                    return Err(error);
                }

                let delay = error
                    .retry_after()
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.backoff_delay(attempt));

                log::warn!(
                    "⚠️ 操作 {} 失败，将在{:.2}秒后重试 (尝试 {}/{}): {}",
                    operation_name,
                    delay.as_secs_f64(),
                    attempt + 1,
                    config.max_retries,
                    error
                );

                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = retry_transient("test_op", &fast_config(), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(EngineError::Timeout("test_op".to_string()))
            } else {
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_rejection() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_transient("test_op", &fast_config(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::OrderRejected("insufficient margin".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_transient("test_op", &fast_config(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Timeout("test_op".to_string()))
        })
        .await;

        assert!(matches!(result.unwrap_err(), EngineError::Timeout(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // 初次 + 3次重试
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(8), Duration::from_millis(1000));
    }
}
