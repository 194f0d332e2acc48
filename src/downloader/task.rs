use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DownloadError, Result};
use super::models::FormatDescriptor;

/// 持久化记录的当前结构版本
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// 排队、下载中、暂停的任务视为活跃任务，同一来源只能存在一个
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Paused
        )
    }

    /// 状态机的合法转移
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Downloading | Cancelled) => true,
            (Downloading, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Downloading | Queued | Cancelled) => true,
            (Failed, Downloading | Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub source_id: String,
    pub format: FormatDescriptor,
    pub destination: PathBuf,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub queue_position: Option<i64>,
}

impl DownloadTask {
    pub fn new(source_id: &str, format: FormatDescriptor, destination: PathBuf) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: source_id.to_string(),
            source_id: source_id.to_string(),
            total_bytes: format.expected_size,
            format,
            destination,
            // 新任务先以排队状态创建，由准入逻辑决定是否立即开始
            status: TaskStatus::Queued,
            progress: 0.0,
            bytes_transferred: 0,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
            last_error: None,
            queue_position: None,
        }
    }

    /// 唯一的状态转移入口，校验源状态并维护时间戳和队列位置
    pub fn transition(&mut self, next: TaskStatus, operation: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::invalid_state(&self.id, self.status, operation));
        }

        let now = Utc::now();
        match next {
            TaskStatus::Downloading => {
                self.started_at = Some(now);
                self.last_error = None;
            }
            TaskStatus::Paused => self.paused_at = Some(now),
            TaskStatus::Completed => {
                if let Some(total) = self.total_bytes {
                    self.bytes_transferred = total;
                } else {
                    self.total_bytes = Some(self.bytes_transferred);
                }
                self.progress = 1.0;
            }
            TaskStatus::Queued | TaskStatus::Failed | TaskStatus::Cancelled => {}
        }

        self.completed_at = (next == TaskStatus::Completed).then_some(now);
        if next != TaskStatus::Queued {
            self.queue_position = None;
        }
        self.status = next;
        Ok(())
    }

    /// 更新字节计数，保证 bytes_transferred <= total_bytes 且 progress 落在 [0, 1]
    pub fn record_bytes(&mut self, bytes: u64, total: Option<u64>) {
        let total = total.or(self.total_bytes);
        self.total_bytes = total.map(|t| t.max(bytes));
        self.bytes_transferred = bytes;
        self.progress = match self.total_bytes {
            Some(0) | None => 0.0,
            Some(t) => (bytes as f64 / t as f64).clamp(0.0, 1.0),
        };
    }

    /// 用磁盘上的文件长度校正字节计数，不改动已知的远端总大小
    ///
    /// 文件比已知总大小还长时，本地文件不可用于续传，计数归零。
    pub fn reconcile_with_disk(&mut self, on_disk: u64) {
        match self.total_bytes {
            Some(total) if on_disk > total => self.reset_progress(),
            total => self.record_bytes(on_disk, total),
        }
    }

    pub fn reset_progress(&mut self) {
        self.bytes_transferred = 0;
        self.progress = 0.0;
    }
}
