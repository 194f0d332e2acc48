//! 媒体下载调度：并发上限、优先级队列、暂停/续传、失败重试和进度订阅。

pub mod common;
pub mod downloader;

pub use common::config::DownloaderConfig;
pub use downloader::{DownloadError, DownloadManager, Result};
