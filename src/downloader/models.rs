use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{DownloadTask, TaskStatus};

/// 解析得到的某一种编码格式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub url: String,
    #[serde(default)]
    pub expected_size: Option<u64>,
    pub label: String,
    #[serde(default)]
    pub mime_info: Option<String>,
}

/// 解析器返回的媒体描述，source_id 用来派生任务 id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub source_id: String,
    pub format: FormatDescriptor,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub label: String,
    pub destination: PathBuf,
    pub status: TaskStatus,
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub queue_position: Option<i64>,
}

impl From<&DownloadTask> for TaskSnapshot {
    fn from(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            source_id: task.source_id.clone(),
            url: task.format.url.clone(),
            label: task.format.label.clone(),
            destination: task.destination.clone(),
            status: task.status,
            progress: task.progress,
            bytes_transferred: task.bytes_transferred,
            total_bytes: task.total_bytes,
            created_at: task.created_at,
            started_at: task.started_at,
            paused_at: task.paused_at,
            completed_at: task.completed_at,
            last_error: task.last_error.clone(),
            queue_position: task.queue_position,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// 字节/秒
    pub speed: f64,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFilter {
    #[default]
    All,
    Active,
    Status(TaskStatus),
}

impl TaskFilter {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Active => status.is_active(),
            TaskFilter::Status(s) => *s == status,
        }
    }
}
