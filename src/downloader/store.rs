use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::{DownloadError, Result};
use super::task::{DownloadTask, SCHEMA_VERSION, TaskStatus};

/// 任务记录的持久化存储，save/update 返回时必须已经落盘
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn save(&self, task: &DownloadTask) -> Result<()>;
    async fn update(&self, task: &DownloadTask) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<DownloadTask>>;
    async fn list_all(&self) -> Result<Vec<DownloadTask>>;
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<DownloadTask>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }
    async fn delete(&self, id: &str) -> Result<()>;
    /// 按顺序写入排队位置 0..n
    async fn set_queue_order(&self, ids: &[String]) -> Result<()>;
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    schema_version: u32,
    tasks: Vec<&'a DownloadTask>,
}

#[derive(Deserialize)]
struct StoreDocument {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    tasks: Vec<Value>,
}

/// 单个 JSON 状态文件，每个任务一条记录
///
/// 写入先落到临时文件并 fsync，再原子地 rename 覆盖正式文件。
pub struct JsonFileStore {
    path: PathBuf,
    tasks: Mutex<BTreeMap<String, DownloadTask>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tasks = if tokio::fs::try_exists(&path).await? {
            Self::read_document(&path).await?
        } else {
            debug!("状态文件不存在，将在首次写入时创建: {}", path.display());
            BTreeMap::new()
        };
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(path: &Path) -> Result<BTreeMap<String, DownloadTask>> {
        let raw = tokio::fs::read(path).await?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let doc: StoreDocument = serde_json::from_slice(&raw)?;
        if doc.schema_version > SCHEMA_VERSION {
            warn!(
                "状态文件版本 {} 高于当前支持的 {}，未知字段将被忽略",
                doc.schema_version, SCHEMA_VERSION
            );
        }

        let mut tasks = BTreeMap::new();
        for value in doc.tasks {
            // 单条记录损坏不影响其余任务
            match serde_json::from_value::<DownloadTask>(value) {
                Ok(task) => {
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => warn!("跳过无法解析的任务记录: {}", e),
            }
        }
        debug!("从 {} 读取了 {} 个任务", path.display(), tasks.len());
        Ok(tasks)
    }

    async fn persist(&self, tasks: &BTreeMap<String, DownloadTask>) -> Result<()> {
        let doc = StoreDocumentRef {
            schema_version: SCHEMA_VERSION,
            tasks: tasks.values().collect(),
        };
        let data = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// 在副本上修改并落盘，成功后才替换内存中的数据
    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, DownloadTask>) -> Result<()> + Send,
    {
        let mut guard = self.tasks.lock().await;
        let mut next = guard.clone();
        f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl DownloadStore for JsonFileStore {
    async fn save(&self, task: &DownloadTask) -> Result<()> {
        self.mutate(|tasks| {
            tasks.insert(task.id.clone(), task.clone());
            Ok(())
        })
        .await
    }

    async fn update(&self, task: &DownloadTask) -> Result<()> {
        self.mutate(|tasks| match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(DownloadError::NotFound(task.id.clone())),
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadTask>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.mutate(|tasks| {
            tasks.remove(id);
            Ok(())
        })
        .await
    }

    async fn set_queue_order(&self, ids: &[String]) -> Result<()> {
        self.mutate(|tasks| {
            for (position, id) in ids.iter().enumerate() {
                if let Some(task) = tasks.get_mut(id) {
                    task.queue_position = Some(position as i64);
                }
            }
            Ok(())
        })
        .await
    }
}

/// 内存存储，可以模拟写入失败
#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<String, DownloadTask>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = DownloadTask>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.tasks.insert(task.id.clone(), task);
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 成功写入的次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DownloadError::Storage("模拟的写入失败".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn save(&self, task: &DownloadTask) -> Result<()> {
        self.check_writable()?;
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &DownloadTask) -> Result<()> {
        if !self.tasks.contains_key(&task.id) {
            return Err(DownloadError::NotFound(task.id.clone()));
        }
        self.check_writable()?;
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadTask>> {
        Ok(self.tasks.get(id).map(|t| t.value().clone()))
    }

    async fn list_all(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.tasks.iter().map(|t| t.value().clone()).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.tasks.remove(id);
        Ok(())
    }

    async fn set_queue_order(&self, ids: &[String]) -> Result<()> {
        self.check_writable()?;
        for (position, id) in ids.iter().enumerate() {
            if let Some(mut task) = self.tasks.get_mut(id) {
                task.queue_position = Some(position as i64);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::FormatDescriptor;

    fn task(id: &str, status: TaskStatus) -> DownloadTask {
        let mut task = DownloadTask::new(
            id,
            FormatDescriptor {
                url: format!("https://cdn.example.com/{}.mp4", id),
                expected_size: Some(100),
                label: "720p".to_string(),
                mime_info: None,
            },
            PathBuf::from(format!("/tmp/{}.mp4", id)),
        );
        task.status = status;
        task
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.save(&task("a", TaskStatus::Paused)).await.unwrap();
        store.save(&task("b", TaskStatus::Queued)).await.unwrap();
        let mut a = task("a", TaskStatus::Paused);
        a.bytes_transferred = 42;
        store.update(&a).await.unwrap();
        store.delete("b").await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes_transferred, 42);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn json_store_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let good = serde_json::to_value(task("ok", TaskStatus::Completed)).unwrap();
        let doc = serde_json::json!({
            "schema_version": 99,
            "tasks": [good, {"id": "broken"}]
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "ok");
    }

    #[tokio::test]
    async fn update_of_unknown_task_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json")).await.unwrap();
        let err = store.update(&task("x", TaskStatus::Paused)).await.unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_order_and_status_listing() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.save(&task(id, TaskStatus::Queued)).await.unwrap();
        }
        store.save(&task("d", TaskStatus::Failed)).await.unwrap();
        store
            .set_queue_order(&["c".to_string(), "a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(store.get("c").await.unwrap().unwrap().queue_position, Some(0));
        assert_eq!(store.get("b").await.unwrap().unwrap().queue_position, Some(2));
        assert_eq!(store.list_by_status(TaskStatus::Queued).await.unwrap().len(), 3);
        assert_eq!(store.list_by_status(TaskStatus::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_can_refuse_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save(&task("a", TaskStatus::Queued)).await,
            Err(DownloadError::Storage(_))
        ));
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.write_count(), 0);
    }
}
