use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use media_downloader::common::config::{DownloaderConfig, validate_max_concurrent};
use media_downloader::common::logger::PrettyLogger;
use media_downloader::downloader::{
    AlwaysOnline, DirectResolver, DownloadError, DownloadManager, JsonFileStore, MediaDescriptor,
    MediaResolver, ProgressEvent, TaskFilter, TaskSnapshot, TaskStatus, TransferClient,
};
use media_downloader::{log_error, log_info, log_success, log_warning};

mod cli;

/// 保存路径：优先使用链接里的文件名
fn destination_for(output_dir: &Path, descriptor: &MediaDescriptor) -> PathBuf {
    let name = url::Url::parse(&descriptor.format.url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back())
                .map(str::to_string)
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{}.{}", descriptor.source_id, descriptor.format.label));
    output_dir.join(name)
}

fn progress_bar(multi: &MultiProgress, id: &str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(0));
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_prefix(id.to_string());
    pb
}

fn apply_snapshot(pb: &ProgressBar, snapshot: &TaskSnapshot) {
    if let Some(total) = snapshot.total_bytes {
        pb.set_length(total);
    }
    pb.set_position(snapshot.bytes_transferred);
    pb.set_message(snapshot.status.as_str());
}

/// 把一个任务的进度事件画到进度条上，任务结束或暂停时返回
async fn watch_task(manager: DownloadManager, id: String, pb: ProgressBar) {
    let mut stream = match manager.watch_progress(&id).await {
        Ok(stream) => stream,
        Err(e) => {
            pb.abandon_with_message(format!("无法订阅进度: {}", e));
            return;
        }
    };

    while let Some(event) = stream.next().await {
        match event {
            ProgressEvent::Snapshot(s) | ProgressEvent::StatusChanged(s) => {
                apply_snapshot(&pb, &s);
                match s.status {
                    TaskStatus::Completed => {
                        pb.finish_with_message("完成");
                        break;
                    }
                    TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Cancelled => {
                        pb.abandon_with_message(s.status.as_str());
                        break;
                    }
                    TaskStatus::Queued | TaskStatus::Downloading => {}
                }
            }
            ProgressEvent::Progress(update) => {
                if let Some(total) = update.total_bytes {
                    pb.set_length(total);
                }
                pb.set_position(update.bytes_transferred);
            }
            ProgressEvent::Completed(s) => {
                apply_snapshot(&pb, &s);
                pb.finish_with_message("完成");
                break;
            }
            ProgressEvent::Failed(s) => {
                pb.abandon_with_message(format!(
                    "失败: {}",
                    s.last_error.unwrap_or_default()
                ));
                break;
            }
            ProgressEvent::Cancelled(_) => {
                pb.abandon_with_message("已取消");
                break;
            }
        }
    }
    manager.stop_watching(&stream);
}

/// 解析链接并添加任务，返回新任务的 id
async fn add_urls(
    manager: &DownloadManager,
    resolver: &dyn MediaResolver,
    urls: &[String],
    output_dir: &Path,
) -> Vec<String> {
    let mut ids = Vec::new();
    for url in urls {
        let descriptor = match resolver.resolve(url).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log_error!("解析失败 {}: {}", url, e);
                continue;
            }
        };
        debug!("解析结果: {:?}", descriptor);
        let destination = destination_for(output_dir, &descriptor);
        match manager.start(descriptor, destination.clone()).await {
            Ok(id) => {
                PrettyLogger::file_info(&id, destination.display().to_string());
                ids.push(id);
            }
            Err(DownloadError::Duplicate(id)) => {
                log_warning!("任务 {} 已经存在，跳过", id);
            }
            Err(e) => log_error!("添加任务失败 {}: {}", url, e),
        }
    }
    ids
}

/// 按状态批量继续或重试上次留下的任务
async fn revive(manager: &DownloadManager, status: TaskStatus) -> Vec<String> {
    let mut ids = Vec::new();
    for task in manager.list_tasks(TaskFilter::Status(status)).await {
        let result = match status {
            TaskStatus::Paused => manager.resume(&task.id).await,
            _ => manager.retry(&task.id).await,
        };
        match result {
            Ok(()) => ids.push(task.id),
            Err(e) => log_error!("无法继续任务 {}: {}", task.id, e),
        }
    }
    ids
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认只输出警告，避免打乱进度条
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = cli::Cli::parse();

    let mut config = DownloaderConfig::load(&args.config)
        .with_context(|| format!("读取配置失败: {}", args.config.display()))?;
    if let Some(n) = args.concurrency {
        validate_max_concurrent(n)?;
        config.max_concurrent = n;
    }

    let store = JsonFileStore::open(&args.state_file)
        .await
        .with_context(|| format!("打开状态文件失败: {}", args.state_file.display()))?;
    let transfer = TransferClient::new(&config.transfer)?;
    let manager = DownloadManager::new(
        config,
        Arc::new(store),
        Arc::new(transfer),
        Arc::new(AlwaysOnline),
    )
    .await?;

    if args.list {
        PrettyLogger::title("任务列表");
        for task in manager.list_tasks(TaskFilter::All).await {
            PrettyLogger::task_row(&task);
        }
        return Ok(());
    }

    tokio::fs::create_dir_all(&args.output_dir).await?;
    info!("输出目录: {}", args.output_dir.display());

    let mut ids = Vec::new();
    if args.resume {
        ids.extend(revive(&manager, TaskStatus::Paused).await);
    }
    if args.retry_failed {
        ids.extend(revive(&manager, TaskStatus::Failed).await);
    }
    let resolver = DirectResolver::default();
    ids.extend(add_urls(&manager, &resolver, &args.urls, &args.output_dir).await);
    manager.process_queue().await;

    if ids.is_empty() {
        log_info!("没有需要下载的任务");
        manager.shutdown().await;
        return Ok(());
    }
    log_info!("共 {} 个任务，最大并发 {}", ids.len(), manager.max_concurrent().await);
    PrettyLogger::separator();

    let multi = MultiProgress::new();
    let watchers: Vec<_> = ids
        .iter()
        .map(|id| {
            let pb = progress_bar(&multi, id);
            tokio::spawn(watch_task(manager.clone(), id.clone(), pb))
        })
        .collect();

    tokio::select! {
        _ = futures::future::join_all(watchers) => {}
        _ = tokio::signal::ctrl_c() => {
            log_warning!("收到中断信号，暂停所有下载，下次使用 --resume 继续");
        }
    }
    // 未被观察的任务（例如上次遗留的排队任务）也一并暂停并保存偏移
    manager.shutdown().await;

    PrettyLogger::separator();
    let mut finished = Vec::new();
    for id in &ids {
        match manager.get_task(id).await {
            Ok(task) => {
                PrettyLogger::task_row(&task);
                if task.status == TaskStatus::Completed {
                    finished.push(task.destination.display().to_string());
                }
            }
            Err(e) => error!("读取任务 {} 失败: {}", id, e),
        }
    }
    if finished.len() == ids.len() {
        PrettyLogger::completion_summary(finished);
    } else if !finished.is_empty() {
        log_success!("{} / {} 个任务已完成", finished.len(), ids.len());
    }
    Ok(())
}
