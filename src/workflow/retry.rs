//! 重试策略 - 工作流层
//!
//! 为单个模型调用提供"固定间隔或指数退避"的重试执行器。
//! 错误分类来自 [`AppError::is_transient`]：瞬时错误（网络、超时）重试，
//! 永久错误（图片损坏、格式不符）立刻放弃。

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RunSettings;
use crate::error::{AppError, AppResult};

/// 重试行为配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    /// 基础重试间隔
    pub base_delay: Duration,
    /// 间隔上限，防止退避无限增长
    pub max_delay: Duration,
    /// true 时间隔逐次翻倍，false 时固定为基础间隔
    pub backoff: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RunSettings) -> Self {
        let base = Duration::from_secs_f64(settings.retry_delay_secs);
        Self {
            max_attempts: settings.max_retries.max(1),
            base_delay: base,
            max_delay: base.saturating_mul(10),
            backoff: settings.retry_backoff,
        }
    }

    /// 计算第 attempt 次失败后的等待时长（attempt 从 0 开始）
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.backoff {
            return self.base_delay;
        }
        // 2^attempt 用带检查的移位计算，尝试次数过大时饱和到上限
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default())
    }
}

/// 以重试方式执行一个异步操作
///
/// `operation` 接收当前尝试序号（从 0 开始）。瞬时错误在尝试次数
/// 耗尽前等待后重试；永久错误与最后一次瞬时错误直接返回。
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> AppResult<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 0..max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "第 {}/{} 次尝试失败，{:.1} 秒后重试: {}",
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    // 循环在最后一次尝试时必然返回，仅 max_attempts 被直接构造为 0 时走到这里
    Err(AppError::Other("重试循环未产生结果".to_string()))
}
