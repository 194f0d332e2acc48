use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use super::collaborators::Connectivity;
use super::core::{Transfer, TransferProgress, TransferRequest, TransferSummary, local_file_len};
use super::error::{DownloadError, Result};
use super::models::{MediaDescriptor, ProgressUpdate, TaskFilter, TaskSnapshot};
use super::progress::{ProgressEvent, ProgressHub, ProgressStream};
use super::queue::DownloadQueue;
use super::retry::RetryPolicy;
use super::session::{SessionEvent, TransferSession};
use super::store::DownloadStore;
use super::task::{DownloadTask, TaskStatus};
use crate::common::config::{DownloaderConfig, validate_max_concurrent};

/// 下载调度器
///
/// 持有任务表和等待队列，所有状态转移都在同一把锁内串行执行；
/// 每个下载中的任务对应一个独立的传输会话。
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: DownloaderConfig,
    state: Mutex<Registry>,
    store: Arc<dyn DownloadStore>,
    transfer: Arc<dyn Transfer>,
    connectivity: Arc<dyn Connectivity>,
    retry: RetryPolicy,
    hub: ProgressHub,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct Registry {
    tasks: HashMap<String, DownloadTask>,
    queue: DownloadQueue,
    sessions: HashMap<String, TransferSession>,
    max_concurrent: usize,
    next_generation: u64,
}

impl Registry {
    fn downloading_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }

    fn has_free_slot(&self) -> bool {
        self.downloading_count() < self.max_concurrent
    }

    fn task(&self, id: &str) -> Result<&DownloadTask> {
        self.tasks
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.generation == generation)
    }
}

impl DownloadManager {
    /// 创建调度器并从存储中恢复任务
    ///
    /// 重启前处于 downloading 的任务没有存活的会话，统一改为 paused；
    /// 排队任务保持排队，需要时调用 [`DownloadManager::process_queue`] 开始。
    pub async fn new(
        config: DownloaderConfig,
        store: Arc<dyn DownloadStore>,
        transfer: Arc<dyn Transfer>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        config.validate()?;

        let mut tasks = HashMap::new();
        let mut queued = Vec::new();
        for mut task in store.list_all().await? {
            if task.status == TaskStatus::Downloading {
                task.transition(TaskStatus::Paused, "restore")?;
                let on_disk = local_file_len(&task.destination).await;
                task.reconcile_with_disk(on_disk);
                store.update(&task).await?;
                info!("任务 {} 在上次退出时仍在下载，已恢复为暂停", task.id);
            }
            if task.status == TaskStatus::Queued {
                queued.push((task.queue_position, task.created_at, task.id.clone()));
            }
            tasks.insert(task.id.clone(), task);
        }

        let mut queue = DownloadQueue::new();
        queued.sort_by_key(|(pos, created, _)| (pos.unwrap_or(i64::MAX), *created));
        for (position, _, id) in queued {
            match position {
                Some(position) => queue.insert(&id, position),
                None => {
                    let position = queue.push_back(&id);
                    if let Some(task) = tasks.get_mut(&id) {
                        task.queue_position = Some(position);
                    }
                }
            }
        }
        info!("已恢复 {} 个任务，其中 {} 个在排队", tasks.len(), queue.len());

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            retry: RetryPolicy::from_config(&config.retry),
            state: Mutex::new(Registry {
                tasks,
                queue,
                sessions: HashMap::new(),
                max_concurrent: config.max_concurrent,
                next_generation: 0,
            }),
            config,
            store,
            transfer,
            connectivity,
            hub: ProgressHub::new(),
            events,
        });
        tokio::spawn(supervise(Arc::downgrade(&shared), rx));

        Ok(Self { shared })
    }

    /// 添加下载任务，有空闲槽位时立即开始，否则进入队列
    pub async fn start(
        &self,
        descriptor: MediaDescriptor,
        destination: impl Into<PathBuf>,
    ) -> Result<String> {
        let destination = destination.into();
        if destination.as_os_str().is_empty() {
            return Err(DownloadError::Validation("保存路径不能为空".to_string()));
        }
        if descriptor.format.url.trim().is_empty() {
            return Err(DownloadError::Validation("下载地址不能为空".to_string()));
        }
        if descriptor.source_id.trim().is_empty() {
            return Err(DownloadError::Validation("来源 id 不能为空".to_string()));
        }

        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        if let Some(existing) = reg.tasks.get(&descriptor.source_id) {
            if existing.status.is_active() {
                return Err(DownloadError::Duplicate(descriptor.source_id));
            }
        }
        if !shared.connectivity.is_connected() {
            return Err(DownloadError::NetworkUnavailable);
        }

        let mut task = DownloadTask::new(&descriptor.source_id, descriptor.format, destination);
        let admitted = reg.has_free_slot();
        if admitted {
            task.transition(TaskStatus::Downloading, "start")?;
        } else {
            task.queue_position = Some(reg.queue.next_position());
        }
        shared.store.save(&task).await?;

        let id = task.id.clone();
        // 同 id 的旧记录已经结束，新任务直接替换
        shared.hub.close(&id);
        let snapshot = TaskSnapshot::from(&task);
        reg.tasks.insert(id.clone(), task);
        if admitted {
            shared.launch(&mut reg, &id, 0);
            info!("任务 {} 开始下载", id);
        } else {
            reg.queue.insert(&id, snapshot.queue_position.unwrap_or_default());
            info!("任务 {} 已加入队列，位置 {:?}", id, snapshot.queue_position);
        }
        shared
            .hub
            .publish(&id, ProgressEvent::StatusChanged(snapshot));
        Ok(id)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let task = reg.task(id)?;
        if task.status != TaskStatus::Downloading {
            return Err(DownloadError::invalid_state(id, task.status, "pause"));
        }

        let mut next = task.clone();
        next.transition(TaskStatus::Paused, "pause")?;
        shared.store.update(&next).await?;

        // 会话退出后才算暂停完成，之后不会再有进度事件
        if let Some(session) = reg.sessions.remove(id) {
            session.stop().await;
        }
        shared.sync_offset_with_disk(&mut next).await;

        let snapshot = TaskSnapshot::from(&next);
        reg.tasks.insert(id.to_string(), next);
        info!("任务 {} 已暂停，偏移 {}", id, snapshot.bytes_transferred);
        shared
            .hub
            .publish(id, ProgressEvent::StatusChanged(snapshot));

        shared.process_queue_locked(&mut reg).await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let task = reg.task(id)?;
        if task.status != TaskStatus::Paused {
            return Err(DownloadError::invalid_state(id, task.status, "resume"));
        }
        if !shared.connectivity.is_connected() {
            return Err(DownloadError::NetworkUnavailable);
        }
        let next = task.clone();
        shared.admit_or_enqueue(&mut reg, next, "resume").await
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let task = reg.task(id)?;
        if !matches!(
            task.status,
            TaskStatus::Downloading | TaskStatus::Paused | TaskStatus::Queued
        ) {
            return Err(DownloadError::invalid_state(id, task.status, "cancel"));
        }

        let freed_slot = task.status == TaskStatus::Downloading;
        let mut next = task.clone();
        next.transition(TaskStatus::Cancelled, "cancel")?;
        next.reset_progress();
        shared.store.update(&next).await?;

        if let Some(session) = reg.sessions.remove(id) {
            session.stop().await;
        }
        reg.queue.remove(id);
        remove_partial_file(&next.destination).await;

        let snapshot = TaskSnapshot::from(&next);
        reg.tasks.insert(id.to_string(), next);
        info!("任务 {} 已取消", id);
        shared.hub.publish(id, ProgressEvent::Cancelled(snapshot));

        if freed_slot {
            shared.process_queue_locked(&mut reg).await;
        }
        Ok(())
    }

    pub async fn retry(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let task = reg.task(id)?;
        if task.status != TaskStatus::Failed {
            return Err(DownloadError::invalid_state(id, task.status, "retry"));
        }
        if !shared.connectivity.is_connected() {
            return Err(DownloadError::NetworkUnavailable);
        }
        let next = task.clone();
        shared.admit_or_enqueue(&mut reg, next, "retry").await
    }

    /// 删除任务记录和已下载的文件，任何状态都可以删除
    pub async fn delete(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let task = reg.task(id)?;
        let freed_slot = task.status == TaskStatus::Downloading;
        let destination = task.destination.clone();

        shared.store.delete(id).await?;

        if let Some(session) = reg.sessions.remove(id) {
            session.stop().await;
        }
        reg.queue.remove(id);
        reg.tasks.remove(id);
        remove_partial_file(&destination).await;
        shared.hub.close(id);
        info!("任务 {} 已删除", id);

        if freed_slot {
            shared.process_queue_locked(&mut reg).await;
        }
        Ok(())
    }

    /// 调整并发上限；调大时立即补充下载，调小时不会打断已经在下载的任务
    pub async fn set_max_concurrent(&self, n: usize) -> Result<()> {
        validate_max_concurrent(n)?;
        let mut reg = self.shared.state.lock().await;
        reg.max_concurrent = n;
        info!("最大并发数调整为 {}", n);
        self.shared.process_queue_locked(&mut reg).await;
        Ok(())
    }

    pub async fn max_concurrent(&self) -> usize {
        self.shared.state.lock().await.max_concurrent
    }

    /// 按给定顺序重排等待队列，id 集合必须与当前排队任务一致
    pub async fn reorder_queue(&self, ids: &[String]) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        reg.queue.validate_order(ids)?;
        shared.store.set_queue_order(ids).await?;
        reg.queue.reorder(ids)?;
        for id in ids {
            let position = reg.queue.position_of(id);
            if let Some(task) = reg.tasks.get_mut(id) {
                task.queue_position = position;
            }
        }
        debug!("队列已重排: {:?}", ids);
        Ok(())
    }

    /// 当前排队顺序
    pub async fn queued_ids(&self) -> Vec<String> {
        self.shared.state.lock().await.queue.ids()
    }

    /// 订阅任务进度，第一条事件总是当前快照
    pub async fn watch_progress(&self, id: &str) -> Result<ProgressStream> {
        let reg = self.shared.state.lock().await;
        let snapshot = TaskSnapshot::from(reg.task(id)?);
        Ok(self.shared.hub.subscribe(snapshot))
    }

    pub fn stop_watching(&self, stream: &ProgressStream) -> bool {
        self.shared
            .hub
            .unsubscribe(stream.task_id(), stream.watcher_id())
    }

    pub async fn get_task(&self, id: &str) -> Result<TaskSnapshot> {
        let reg = self.shared.state.lock().await;
        reg.task(id).map(TaskSnapshot::from)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<TaskSnapshot> {
        let reg = self.shared.state.lock().await;
        let mut list: Vec<TaskSnapshot> = reg
            .tasks
            .values()
            .filter(|t| filter.matches(t.status))
            .map(TaskSnapshot::from)
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// 按队列顺序准入任务，直到队列为空或达到并发上限
    pub async fn process_queue(&self) {
        let mut reg = self.shared.state.lock().await;
        self.shared.process_queue_locked(&mut reg).await;
    }

    /// 暂停所有正在下载的任务并保存偏移，下次启动时可以继续
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let mut reg = shared.state.lock().await;
        let downloading: Vec<String> = reg
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .map(|t| t.id.clone())
            .collect();

        for id in downloading {
            if let Some(session) = reg.sessions.remove(&id) {
                session.stop().await;
            }
            let Some(mut task) = reg.tasks.get(&id).cloned() else {
                continue;
            };
            if task.transition(TaskStatus::Paused, "shutdown").is_err() {
                continue;
            }
            let on_disk = local_file_len(&task.destination).await;
            task.reconcile_with_disk(on_disk);
            if let Err(e) = shared.store.update(&task).await {
                error!("关闭时保存任务 {} 失败: {}", id, e);
            }
            let snapshot = TaskSnapshot::from(&task);
            reg.tasks.insert(id.clone(), task);
            shared
                .hub
                .publish(&id, ProgressEvent::StatusChanged(snapshot));
        }
        info!("下载调度器已关闭");
    }
}

impl Shared {
    /// 为任务启动一个新的传输会话
    fn launch(&self, reg: &mut Registry, id: &str, offset: u64) {
        let Some(task) = reg.tasks.get(id) else {
            return;
        };
        let request = TransferRequest {
            url: task.format.url.clone(),
            destination: task.destination.clone(),
            offset,
            expected_size: task.total_bytes.or(task.format.expected_size),
        };
        let generation = reg.next_generation;
        reg.next_generation += 1;

        let session = TransferSession::spawn(
            id.to_string(),
            generation,
            request,
            Arc::clone(&self.transfer),
            self.retry.clone(),
            self.config.speed_window(),
            self.events.clone(),
        );
        if let Some(old) = reg.sessions.insert(id.to_string(), session) {
            warn!("任务 {} 存在未清理的会话 (generation {})", id, old.generation);
        }
    }

    /// 续传偏移：从未开始过的任务从 0 开始，否则以磁盘上的文件长度为准
    async fn resume_offset(task: &DownloadTask) -> u64 {
        if task.started_at.is_none() {
            return 0;
        }
        let on_disk = local_file_len(&task.destination).await;
        match task.total_bytes {
            // 文件比远端还大，无法续传
            Some(total) if on_disk > total => 0,
            _ => on_disk,
        }
    }

    /// 暂停后把记录中的字节数校正为磁盘上的实际长度
    async fn sync_offset_with_disk(&self, task: &mut DownloadTask) {
        let on_disk = local_file_len(&task.destination).await;
        let before = task.bytes_transferred;
        task.reconcile_with_disk(on_disk);
        if task.bytes_transferred == before {
            return;
        }
        if let Err(e) = self.store.update(task).await {
            warn!("保存任务 {} 的偏移失败: {}", task.id, e);
        }
    }

    /// 有空闲槽位则开始下载，否则排队
    async fn admit_or_enqueue(
        &self,
        reg: &mut Registry,
        mut next: DownloadTask,
        operation: &'static str,
    ) -> Result<()> {
        let id = next.id.clone();
        if reg.has_free_slot() {
            let offset = Self::resume_offset(&next).await;
            next.transition(TaskStatus::Downloading, operation)?;
            if offset == 0 {
                next.reset_progress();
            } else {
                next.record_bytes(offset, next.total_bytes);
            }
            self.store.update(&next).await?;

            let snapshot = TaskSnapshot::from(&next);
            reg.tasks.insert(id.clone(), next);
            self.launch(reg, &id, offset);
            info!("任务 {} 从偏移 {} 继续下载 ({})", id, offset, operation);
            self.hub
                .publish(&id, ProgressEvent::StatusChanged(snapshot));
        } else {
            next.transition(TaskStatus::Queued, operation)?;
            let position = reg.queue.next_position();
            next.queue_position = Some(position);
            self.store.update(&next).await?;

            let snapshot = TaskSnapshot::from(&next);
            reg.tasks.insert(id.clone(), next);
            reg.queue.insert(&id, position);
            info!("没有空闲槽位，任务 {} 进入队列 ({})", id, operation);
            self.hub
                .publish(&id, ProgressEvent::StatusChanged(snapshot));
        }
        Ok(())
    }

    async fn process_queue_locked(&self, reg: &mut Registry) {
        while reg.has_free_slot() {
            let Some(id) = reg.queue.pop_front() else {
                break;
            };
            let Some(task) = reg.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }

            let position = task.queue_position.unwrap_or_default();
            let mut next = task.clone();
            let offset = Self::resume_offset(&next).await;
            if next.transition(TaskStatus::Downloading, "admit").is_err() {
                continue;
            }
            if offset == 0 {
                next.reset_progress();
            } else {
                next.record_bytes(offset, next.total_bytes);
            }
            if let Err(e) = self.store.update(&next).await {
                error!("准入任务 {} 时保存失败: {}", id, e);
                reg.queue.insert(&id, position);
                break;
            }

            let snapshot = TaskSnapshot::from(&next);
            reg.tasks.insert(id.clone(), next);
            self.launch(reg, &id, offset);
            info!("队列任务 {} 开始下载", id);
            self.hub
                .publish(&id, ProgressEvent::StatusChanged(snapshot));
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        let mut reg = self.state.lock().await;
        match event {
            SessionEvent::Progress {
                task_id,
                generation,
                progress,
            } => {
                if reg.is_current(&task_id, generation) {
                    self.on_progress(&mut reg, &task_id, progress).await;
                }
            }
            SessionEvent::Finished {
                task_id,
                generation,
                result,
            } => {
                if !reg.is_current(&task_id, generation) {
                    debug!("忽略已停止会话的结果: {} (generation {})", task_id, generation);
                    return;
                }
                let session = reg.sessions.remove(&task_id);
                self.on_finished(&mut reg, &task_id, result).await;
                drop(session);
                self.process_queue_locked(&mut reg).await;
            }
        }
    }

    async fn on_progress(&self, reg: &mut Registry, id: &str, progress: TransferProgress) {
        let Registry {
            tasks, sessions, ..
        } = reg;
        let (Some(task), Some(session)) = (tasks.get_mut(id), sessions.get_mut(id)) else {
            return;
        };
        if task.status != TaskStatus::Downloading {
            return;
        }

        let bytes = progress.bytes_transferred;
        if bytes < task.bytes_transferred {
            if bytes != 0 {
                return;
            }
            // 服务器不支持续传，从头开始
            session.speed.reset();
        }
        task.record_bytes(bytes, progress.total_bytes);
        session.speed.record(bytes);

        if session.last_persisted.elapsed() >= self.config.progress_persist_interval() {
            session.last_persisted = Instant::now();
            if let Err(e) = self.store.update(task).await {
                warn!("保存任务 {} 的进度失败: {}", id, e);
            }
        }

        let update = ProgressUpdate {
            task_id: id.to_string(),
            progress: task.progress,
            bytes_transferred: task.bytes_transferred,
            total_bytes: task.total_bytes,
            speed: session.speed.speed(),
            eta_seconds: session
                .speed
                .eta_seconds(task.bytes_transferred, task.total_bytes),
        };
        self.hub.publish(id, ProgressEvent::Progress(update));
    }

    async fn on_finished(&self, reg: &mut Registry, id: &str, result: Result<TransferSummary>) {
        let Some(current) = reg.tasks.get(id).cloned() else {
            return;
        };
        if current.status != TaskStatus::Downloading {
            return;
        }
        let mut next = current.clone();

        match result {
            Ok(summary) => {
                next.record_bytes(summary.bytes_transferred, summary.total_bytes);
                if let Err(e) = next.transition(TaskStatus::Completed, "complete") {
                    error!("任务 {} 无法标记为完成: {}", id, e);
                    return;
                }
                match self.store.update(&next).await {
                    Ok(()) => {
                        info!("✅ 下载任务完成: {}", id);
                        let snapshot = TaskSnapshot::from(&next);
                        reg.tasks.insert(id.to_string(), next);
                        self.hub.publish(id, ProgressEvent::Completed(snapshot));
                    }
                    Err(e) => {
                        error!("任务 {} 已下载完成但保存状态失败: {}", id, e);
                        let mut failed = current;
                        self.fail(reg, &mut failed, format!("保存完成状态失败: {}", e))
                            .await;
                    }
                }
            }
            Err(DownloadError::Cancelled) => {
                debug!("任务 {} 的会话被取消", id);
            }
            Err(e) => {
                error!("❌ 下载任务失败: {}, 错误: {}", id, e);
                self.fail(reg, &mut next, e.to_string()).await;
            }
        }
    }

    async fn fail(&self, reg: &mut Registry, task: &mut DownloadTask, message: String) {
        if task.transition(TaskStatus::Failed, "fail").is_err() {
            return;
        }
        let on_disk = local_file_len(&task.destination).await;
        task.reconcile_with_disk(on_disk);
        task.last_error = Some(message);
        if let Err(e) = self.store.update(task).await {
            // 没有会话可以回滚到下载中，内存里仍然标记为失败
            error!("保存任务 {} 的失败状态失败: {}", task.id, e);
        }
        let snapshot = TaskSnapshot::from(&*task);
        reg.tasks.insert(task.id.clone(), task.clone());
        self.hub.publish(&task.id, ProgressEvent::Failed(snapshot));
    }
}

async fn supervise(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_session_event(event).await;
    }
    debug!("会话事件循环退出");
}

async fn remove_partial_file(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除文件: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件 {} 失败: {}", path.display(), e),
    }
}
