//! 共享限流器
//! 所有仓位任务共用同一条交易所连接，访问统一经过这里，
//! 避免单个仓位的轮询挤占其他仓位或触发交易所限频。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};
use tokio::time::sleep;

use crate::core::error::EngineError;
use crate::core::types::Result;

/// 限流器（滑动窗口 + 错误时自适应降速）
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    max_per_second: u32,
    current_delay_ms: AtomicU64,
    request_times: RwLock<Vec<Instant>>,
    last_error_time: RwLock<Option<Instant>>,
    error_count: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        let permits = max_per_second.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            max_per_second: max_per_second.max(1),
            current_delay_ms: AtomicU64::new(0),
            request_times: RwLock::new(Vec::new()),
            last_error_time: RwLock::new(None),
            error_count: AtomicU64::new(0),
        }
    }

    /// 报告请求错误（触发自适应降速）
    pub async fn report_error(&self) {
        let error_count = self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error_time.write().await = Some(Instant::now());

        let current_delay = self.current_delay_ms.load(Ordering::Relaxed);
        let new_delay = if current_delay == 0 {
            100
        } else {
            (current_delay * 2).min(5000)
        };
        self.current_delay_ms.store(new_delay, Ordering::Relaxed);

        log::warn!(
            "请求错误，限流延迟增加到 {}ms (累计错误: {})",
            new_delay,
            error_count + 1
        );
    }

    /// 一段时间无错误后逐步恢复正常速度
    async fn try_recover(&self) {
        let last_error = *self.last_error_time.read().await;
        if let Some(time) = last_error {
            if time.elapsed() > Duration::from_secs(30) {
                let current_delay = self.current_delay_ms.load(Ordering::Relaxed);
                if current_delay > 0 {
                    let new_delay = current_delay / 2;
                    self.current_delay_ms.store(new_delay, Ordering::Relaxed);
                    if new_delay == 0 {
                        self.error_count.store(0, Ordering::Relaxed);
                        log::info!("限流已恢复正常");
                    } else {
                        log::info!("限流延迟降低到 {}ms", new_delay);
                    }
                    *self.last_error_time.write().await = Some(Instant::now());
                }
            }
        }
    }

    /// 等待直到允许发送下一个请求
    pub async fn acquire(&self) -> Result<()> {
        let delay_ms = self.current_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }

        self.try_recover().await;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EngineError::Other(format!("限流器已关闭: {}", e)))?;

        // 滑动窗口：最近1秒内的请求数不超过上限
        loop {
            let mut times = self.request_times.write().await;
            let now = Instant::now();
            times.retain(|t| now.duration_since(*t) < Duration::from_secs(1));

            if times.len() < self.max_per_second as usize {
                times.push(now);
                return Ok(());
            }

            drop(times);
            sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_within_limit() {
        let limiter = RateLimiter::new(100);
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_window_throttles_burst() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await.unwrap();
        }
        // 4个请求在每秒2个的限制下至少跨越一个窗口
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_error_increases_delay() {
        let limiter = RateLimiter::new(10);
        limiter.report_error().await;
        assert_eq!(limiter.current_delay_ms.load(Ordering::Relaxed), 100);
        limiter.report_error().await;
        assert_eq!(limiter.current_delay_ms.load(Ordering::Relaxed), 200);
    }
}
