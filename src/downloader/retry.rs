use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{DownloadError, Result};
use crate::common::config::RetryConfig;

/// 固定退避表的重试策略，表用完后重复最后一个间隔
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config
                .backoff_secs
                .iter()
                // 无法表示的间隔按不等待处理
                .map(|s| Duration::try_from_secs_f64(*s).unwrap_or(Duration::ZERO))
                .collect(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 retry 次重试（从 0 开始）之前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = (retry as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// 执行 op，只对可重试错误重试；等待期间被取消立即返回 Cancelled
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "第 {} 次尝试失败: {}，{:?} 后重试",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        debug!("重试次数已用完 ({} 次)", self.max_retries);
                    }
                    return Err(e);
                }
            }
        }
    }
}
