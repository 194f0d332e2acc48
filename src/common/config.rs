use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::downloader::error::{DownloadError, Result};

pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloaderConfig {
    pub max_concurrent: usize,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    /// 进度落盘的最小间隔，状态转移不受此限制
    pub progress_persist_interval_ms: u64,
    pub speed_window_secs: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            progress_persist_interval_ms: 1000,
            speed_window_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            user_agent: format!("media_downloader/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_secs: Vec<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: vec![1.0, 2.0, 3.0],
        }
    }
}

impl DownloaderConfig {
    /// 从 JSON 文件读取配置，文件不存在时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| DownloadError::Validation(format!("配置文件格式错误: {}", e)))?;
        config.validate()?;
        debug!("已加载配置: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_max_concurrent(self.max_concurrent)?;
        if self.transfer.connect_timeout_secs == 0 || self.transfer.read_timeout_secs == 0 {
            return Err(DownloadError::Validation("超时时间必须大于 0".to_string()));
        }
        if self
            .retry
            .backoff_secs
            .iter()
            .any(|s| Duration::try_from_secs_f64(*s).is_err())
        {
            return Err(DownloadError::Validation("重试间隔必须是合法的非负秒数".to_string()));
        }
        Ok(())
    }

    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_interval_ms)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs.max(1))
    }
}

pub fn validate_max_concurrent(n: usize) -> Result<()> {
    if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&n) {
        return Err(DownloadError::Validation(format!(
            "最大并发数必须在 {} 到 {} 之间，当前为 {}",
            MIN_CONCURRENT, MAX_CONCURRENT, n
        )));
    }
    Ok(())
}
