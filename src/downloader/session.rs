use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::core::{Transfer, TransferProgress, TransferRequest, TransferSummary, local_file_len};
use super::error::{DownloadError, Result};
use super::progress::SpeedMeter;
use super::retry::RetryPolicy;

/// 会话回报给调度器的事件，generation 用来丢弃已停止会话的残留事件
#[derive(Debug)]
pub enum SessionEvent {
    Progress {
        task_id: String,
        generation: u64,
        progress: TransferProgress,
    },
    Finished {
        task_id: String,
        generation: u64,
        result: Result<TransferSummary>,
    },
}

/// 一个正在进行的传输
pub struct TransferSession {
    pub task_id: String,
    pub generation: u64,
    pub offset: u64,
    pub(crate) speed: SpeedMeter,
    pub(crate) last_persisted: Instant,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TransferSession {
    pub fn spawn(
        task_id: String,
        generation: u64,
        request: TransferRequest,
        transfer: Arc<dyn Transfer>,
        retry: RetryPolicy,
        speed_window: Duration,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let offset = request.offset;
        let handle = tokio::spawn(run_session(
            task_id.clone(),
            generation,
            request,
            transfer,
            retry,
            cancel.clone(),
            events,
        ));

        Self {
            task_id,
            generation,
            offset,
            speed: SpeedMeter::new(speed_window),
            last_persisted: Instant::now(),
            cancel,
            handle: Some(handle),
        }
    }

    /// 发出取消信号并等待会话真正退出
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("任务 {} 的传输会话异常退出: {}", self.task_id, e);
            }
        }
        debug!("任务 {} 的传输会话已停止", self.task_id);
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(
    task_id: String,
    generation: u64,
    request: TransferRequest,
    transfer: Arc<dyn Transfer>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    events: UnboundedSender<SessionEvent>,
) {
    info!(
        "开始传输任务 {}: {} (偏移 {})",
        task_id, request.url, request.offset
    );

    let result = retry
        .run(&cancel, |attempt| {
            let task_id = task_id.clone();
            let request = request.clone();
            let transfer = Arc::clone(&transfer);
            let cancel = cancel.clone();
            let events = events.clone();
            async move {
                let mut request = request;
                if attempt > 0 {
                    // 重试时从已经写入的位置继续
                    request.offset = local_file_len(&request.destination).await;
                }
                // 每次带 Range 的请求之前都确认服务器支持续传
                if request.offset > 0 {
                    let supported = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        supported = transfer.supports_resume(&request.url) => supported?,
                    };
                    if !supported {
                        warn!("服务器不支持断点续传，任务 {} 从头下载", task_id);
                        request.offset = 0;
                        let _ = events.send(SessionEvent::Progress {
                            task_id: task_id.clone(),
                            generation,
                            progress: TransferProgress {
                                bytes_transferred: 0,
                                total_bytes: request.expected_size,
                            },
                        });
                    }
                }

                let on_progress = |progress: TransferProgress| {
                    let _ = events.send(SessionEvent::Progress {
                        task_id: task_id.clone(),
                        generation,
                        progress,
                    });
                };
                transfer.fetch(&request, &cancel, &on_progress).await
            }
        })
        .await;

    match &result {
        Ok(summary) => debug!(
            "任务 {} 传输结束，共 {} 字节",
            task_id, summary.bytes_transferred
        ),
        Err(DownloadError::Cancelled) => debug!("任务 {} 的传输被取消", task_id),
        Err(e) => warn!("任务 {} 传输失败: {}", task_id, e),
    }

    let _ = events.send(SessionEvent::Finished {
        task_id,
        generation,
        result,
    });
}
