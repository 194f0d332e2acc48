use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{DownloadError, Result};
use super::models::{FormatDescriptor, MediaDescriptor};

/// 网络连通性查询
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }
}

/// 可以手动切换的连通性标志
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(connected: bool) -> Self {
        Self(AtomicBool::new(connected))
    }

    pub fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 把源链接解析成可下载的格式描述
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, source_url: &str) -> Result<MediaDescriptor>;
}

/// 直链解析：源链接本身就是媒体文件
#[derive(Debug, Clone, Default)]
pub struct DirectResolver {
    client: Client,
}

impl DirectResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaResolver for DirectResolver {
    async fn resolve(&self, source_url: &str) -> Result<MediaDescriptor> {
        let parsed = url::Url::parse(source_url)
            .map_err(|e| DownloadError::Validation(format!("无效的URL {}: {}", source_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::UnsupportedFormat(format!(
                "不支持的协议: {}",
                parsed.scheme()
            )));
        }

        let resp = self.client.head(source_url).send().await?;
        let status = resp.status();
        debug!("HEAD {} -> {}", source_url, status);
        if status.is_client_error() {
            return Err(DownloadError::UnsupportedFormat(format!(
                "获取内容信息失败，状态码: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(DownloadError::Network(format!(
                "获取内容信息失败，状态码: {}",
                status
            )));
        }

        let mime_info = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(str::to_string);
        if mime_info.as_deref().is_some_and(|ct| ct.contains("text/html")) {
            return Err(DownloadError::UnsupportedFormat(
                "URL 返回 HTML 内容，可能不是文件下载链接".to_string(),
            ));
        }

        Ok(MediaDescriptor {
            source_id: source_id_for(source_url),
            format: FormatDescriptor {
                url: source_url.to_string(),
                expected_size: resp.content_length().filter(|len| *len > 0),
                label: label_for(&parsed),
                mime_info,
            },
        })
    }
}

/// 由链接派生稳定的来源 id
pub fn source_id_for(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

fn label_for(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_is_stable_and_short() {
        let a = source_id_for("https://cdn.example.com/v.mp4");
        assert_eq!(a, source_id_for("https://cdn.example.com/v.mp4"));
        assert_ne!(a, source_id_for("https://cdn.example.com/w.mp4"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn label_comes_from_extension() {
        let url = url::Url::parse("https://cdn.example.com/path/clip.M4A?x=1").unwrap();
        assert_eq!(label_for(&url), "m4a");
        let url = url::Url::parse("https://cdn.example.com/stream").unwrap();
        assert_eq!(label_for(&url), "bin");
    }

    #[test]
    fn connectivity_flag_toggles() {
        let flag = ConnectivityFlag::new(false);
        assert!(!flag.is_connected());
        flag.set(true);
        assert!(flag.is_connected());
        assert!(AlwaysOnline.is_connected());
    }

    #[tokio::test]
    async fn resolver_rejects_non_http_urls() {
        let resolver = DirectResolver::default();
        assert!(matches!(
            resolver.resolve("ftp://example.com/a.mp4").await,
            Err(DownloadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            resolver.resolve("not a url").await,
            Err(DownloadError::Validation(_))
        ));
    }
}
