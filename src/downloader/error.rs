use thiserror::Error;

use super::task::TaskStatus;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("参数无效: {0}")]
    Validation(String),

    #[error("任务已存在且仍在进行中: {0}")]
    Duplicate(String),

    #[error("任务 {id} 当前状态为 {status}，不允许执行 {operation}")]
    InvalidState {
        id: String,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("网络不可用")]
    NetworkUnavailable,

    #[error("不支持的格式或资源不可用: {0}")]
    UnsupportedFormat(String),

    #[error("传输暂时失败: {0}")]
    TransientTransfer(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("任务未找到: {0}")]
    NotFound(String),

    #[error("传输已取消")]
    Cancelled,
}

impl DownloadError {
    /// 只有超时和 5xx 归为可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::TransientTransfer(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    pub(crate) fn invalid_state(id: &str, status: TaskStatus, operation: &'static str) -> Self {
        DownloadError::InvalidState {
            id: id.to_string(),
            status,
            operation,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        DownloadError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::Storage(format!("序列化失败: {}", error))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return DownloadError::TransientTransfer(format!("请求超时: {}", error));
        }
        if let Some(status) = error.status() {
            if status.is_server_error() {
                return DownloadError::TransientTransfer(format!("服务器错误: {}", status));
            }
            if status.is_client_error() {
                return DownloadError::UnsupportedFormat(format!("请求被拒绝: {}", status));
            }
        }
        DownloadError::Network(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(DownloadError::TransientTransfer("timeout".into()).is_retryable());
        assert!(!DownloadError::UnsupportedFormat("404".into()).is_retryable());
        assert!(!DownloadError::Network("reset".into()).is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(DownloadError::Cancelled.is_cancelled());
    }

    #[test]
    fn io_errors_become_storage_errors() {
        let err: DownloadError = std::io::Error::other("disk full").into();
        assert!(matches!(err, DownloadError::Storage(msg) if msg.contains("disk full")));
    }

    #[test]
    fn invalid_state_message_names_status_and_operation() {
        let err = DownloadError::invalid_state("a", TaskStatus::Completed, "pause");
        let text = err.to_string();
        assert!(text.contains("completed"));
        assert!(text.contains("pause"));
    }
}
