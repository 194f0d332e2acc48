use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, HeaderMap, RANGE, USER_AGENT};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{DownloadError, Result};
use crate::common::config::TransferConfig;

/// 单次传输的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    /// 从该字节偏移续传，0 表示全新下载
    pub offset: u64,
    pub expected_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// 执行一次 HTTP 字节范围下载
#[async_trait]
pub trait Transfer: Send + Sync {
    /// 把 url 的内容追加写入目标文件；被取消时返回 `Cancelled`，已写入的部分保留
    async fn fetch(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<TransferSummary>;

    /// 服务器是否支持范围请求
    async fn supports_resume(&self, url: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct TransferClient {
    inner: Client,
}

impl TransferClient {
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let inner = ClientBuilder::new()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .default_headers(Self::default_headers(&config.user_agent))
            .build()
            .map_err(|e| DownloadError::Validation(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self::with_client(inner))
    }

    pub fn with_client(inner: Client) -> Self {
        Self { inner }
    }

    fn default_headers(user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = user_agent.parse() {
            headers.insert(USER_AGENT, value);
        }
        headers
    }

    // 检查响应状态
    fn check_response_status(response: &Response, url: &str) -> Result<()> {
        let status = response.status();
        debug!("Response Status: {} ({})", status, url);
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
            s if s.is_server_error() => Err(DownloadError::TransientTransfer(format!(
                "服务器错误 {}，URL: {}",
                s, url
            ))),
            s if s.is_client_error() => Err(DownloadError::UnsupportedFormat(format!(
                "请求被拒绝 {}，URL: {}",
                s, url
            ))),
            s => Err(DownloadError::UnsupportedFormat(format!(
                "意外的状态码 {}，URL: {}",
                s, url
            ))),
        }
    }

    async fn open_destination(path: &Path, append: bool) -> Result<File> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = if append {
            OpenOptions::new().append(true).create(true).open(path).await?
        } else {
            File::create(path).await?
        };
        Ok(file)
    }

    async fn stream_body(
        response: Response,
        file: &mut File,
        mut downloaded: u64,
        total: Option<u64>,
        cancel: &CancellationToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<u64> {
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(TransferProgress {
                bytes_transferred: downloaded,
                total_bytes: total.map(|t| t.max(downloaded)),
            });
        }
        Ok(downloaded)
    }
}

#[async_trait]
impl Transfer for TransferClient {
    async fn fetch(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<TransferSummary> {
        let url = request.url.as_str();
        let mut offset = request.offset;

        let mut builder = self.inner.get(url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = builder.send() => response?,
        };

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let remote_total = parse_content_range(response.headers()).and_then(|r| r.total);
            if remote_total.or(request.expected_size) == Some(offset) {
                debug!("本地文件已完整: {}", request.destination.display());
                on_progress(TransferProgress {
                    bytes_transferred: offset,
                    total_bytes: Some(offset),
                });
                return Ok(TransferSummary {
                    bytes_transferred: offset,
                    total_bytes: Some(offset),
                });
            }
            // 本地文件与远端不一致，清空后交给重试从头开始
            File::create(&request.destination).await?;
            return Err(DownloadError::TransientTransfer(format!(
                "续传位置 {} 超出远端文件范围，已清空本地文件",
                offset
            )));
        }

        Self::check_response_status(&response, url)?;

        let status = response.status();
        let total = if status == StatusCode::PARTIAL_CONTENT {
            let range = parse_content_range(response.headers());
            if let Some(start) = range.map(|r| r.start) {
                if start != offset {
                    File::create(&request.destination).await?;
                    return Err(DownloadError::TransientTransfer(format!(
                        "服务器返回的范围起点 {} 与请求的 {} 不一致",
                        start, offset
                    )));
                }
            }
            range
                .and_then(|r| r.total)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            if offset > 0 {
                warn!("服务器忽略了范围请求，从头下载: {}", url);
                offset = 0;
            }
            response.content_length()
        };
        let total = total.or(request.expected_size);

        let mut file = Self::open_destination(&request.destination, offset > 0).await?;
        on_progress(TransferProgress {
            bytes_transferred: offset,
            total_bytes: total,
        });

        let result =
            Self::stream_body(response, &mut file, offset, total, cancel, on_progress).await;
        // 无论成功与否都把已收到的数据落盘，供续传使用
        file.flush().await?;
        file.sync_data().await?;
        let downloaded = result?;

        if let Some(total) = total {
            if downloaded < total {
                return Err(DownloadError::TransientTransfer(format!(
                    "连接提前关闭: 已收到 {} / {} 字节",
                    downloaded, total
                )));
            }
        }

        Ok(TransferSummary {
            bytes_transferred: downloaded,
            total_bytes: Some(total.unwrap_or(downloaded).max(downloaded)),
        })
    }

    async fn supports_resume(&self, url: &str) -> Result<bool> {
        let response = self
            .inner
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(DownloadError::TransientTransfer(format!(
                "探测续传支持失败 {}，URL: {}",
                status, url
            )));
        }
        if status.is_client_error() && status != StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(DownloadError::UnsupportedFormat(format!(
                "请求被拒绝 {}，URL: {}",
                status, url
            )));
        }

        let advertises_bytes = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"));
        let supported = status == StatusCode::PARTIAL_CONTENT || advertises_bytes;
        debug!("续传支持探测: {} -> {}", url, supported);
        Ok(supported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

/// 解析 `Content-Range: bytes a-b/N`、`bytes */N`
pub fn parse_content_range(headers: &HeaderMap) -> Option<ContentRange> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = total.trim().parse::<u64>().ok();
    let range = range.trim();
    if range == "*" {
        return Some(ContentRange {
            start: 0,
            end: None,
            total,
        });
    }
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok(),
        total,
    })
}

/// 目标文件当前长度，不存在时为 0
pub async fn local_file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
