use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::Mutex;
use tracing::debug;

use super::models::{ProgressUpdate, TaskSnapshot};

/// 推送给观察者的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// 订阅时的当前状态，每个订阅者只会收到一次且总是第一条
    Snapshot(TaskSnapshot),
    Progress(ProgressUpdate),
    StatusChanged(TaskSnapshot),
    Failed(TaskSnapshot),
    Completed(TaskSnapshot),
    Cancelled(TaskSnapshot),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed(_) | ProgressEvent::Cancelled(_))
    }
}

struct Watcher {
    id: u64,
    tx: UnboundedSender<ProgressEvent>,
}

/// 按任务分发进度事件
#[derive(Default)]
pub struct ProgressHub {
    watchers: Mutex<HashMap<String, Vec<Watcher>>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新订阅者先收到 snapshot，之后只收到订阅后发布的事件
    pub fn subscribe(&self, snapshot: TaskSnapshot) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded();
        let task_id = snapshot.id.clone();
        let terminal = snapshot.status.is_terminal();
        let watcher_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // 已经结束的任务：只给快照，然后关闭
        let _ = tx.unbounded_send(ProgressEvent::Snapshot(snapshot));
        if !terminal {
            self.watchers
                .lock()
                .entry(task_id.clone())
                .or_default()
                .push(Watcher { id: watcher_id, tx });
        }

        ProgressStream {
            task_id,
            watcher_id,
            rx,
        }
    }

    pub fn publish(&self, task_id: &str, event: ProgressEvent) {
        let terminal = event.is_terminal();
        let mut watchers = self.watchers.lock();
        if let Some(list) = watchers.get_mut(task_id) {
            list.retain(|w| w.tx.unbounded_send(event.clone()).is_ok());
            if list.is_empty() || terminal {
                watchers.remove(task_id);
                debug!("任务 {} 的进度通道已关闭", task_id);
            }
        }
    }

    pub fn unsubscribe(&self, task_id: &str, watcher_id: u64) -> bool {
        let mut watchers = self.watchers.lock();
        let Some(list) = watchers.get_mut(task_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| w.id != watcher_id);
        let removed = list.len() != before;
        if list.is_empty() {
            watchers.remove(task_id);
        }
        removed
    }

    /// 关闭该任务的所有订阅
    pub fn close(&self, task_id: &str) {
        self.watchers.lock().remove(task_id);
    }

    pub fn watcher_count(&self, task_id: &str) -> usize {
        self.watchers.lock().get(task_id).map_or(0, Vec::len)
    }
}

/// 单个订阅者的事件流
pub struct ProgressStream {
    task_id: String,
    watcher_id: u64,
    rx: UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn watcher_id(&self) -> u64 {
        self.watcher_id
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// 滑动窗口测速
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        // 字节数回退说明重新开始了，旧样本作废
        if self.samples.back().is_some_and(|&(_, last)| bytes < last) {
            self.samples.clear();
        }
        self.samples.push_back((now, bytes));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if now.duration_since(t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// 字节/秒
    pub fn speed(&self) -> f64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        b1.saturating_sub(b0) as f64 / elapsed
    }

    pub fn eta_seconds(&self, transferred: u64, total: Option<u64>) -> Option<u64> {
        let total = total?;
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        Some((total.saturating_sub(transferred) as f64 / speed).ceil() as u64)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
