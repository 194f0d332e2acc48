use std::collections::HashSet;

use super::error::{DownloadError, Result};

#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: String,
    position: i64,
    seq: u64,
}

/// 等待准入的任务队列
///
/// position 只是排序键，删除任务后不会重新编号；位置相同时按入队顺序。
#[derive(Debug, Default)]
pub struct DownloadQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到队尾，返回分配的位置
    pub fn push_back(&mut self, task_id: &str) -> i64 {
        let position = self.next_position();
        self.insert(task_id, position);
        position
    }

    /// 队尾位置：当前最大位置加一，空队列为 0
    pub fn next_position(&self) -> i64 {
        self.entries
            .iter()
            .map(|e| e.position)
            .max()
            .map_or(0, |max| max + 1)
    }

    /// 以已知位置插入（重启恢复时使用）
    pub fn insert(&mut self, task_id: &str, position: i64) {
        self.remove(task_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry {
            task_id: task_id.to_string(),
            position,
            seq,
        });
        self.entries.sort_by_key(|e| (e.position, e.seq));
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.task_id != task_id);
        self.entries.len() != before
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.iter().any(|e| e.task_id == task_id)
    }

    /// 取出位置最小的任务
    pub fn pop_front(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).task_id)
        }
    }

    pub fn position_of(&self, task_id: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.task_id == task_id)
            .map(|e| e.position)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.task_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 检查给定 id 集合是否和当前排队集合完全一致
    pub fn validate_order(&self, ids: &[String]) -> Result<()> {
        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        if requested.len() != ids.len() {
            return Err(DownloadError::Validation("重排列表中存在重复的任务".to_string()));
        }
        let current: HashSet<&str> = self.entries.iter().map(|e| e.task_id.as_str()).collect();
        if requested != current {
            return Err(DownloadError::Validation(
                "重排列表必须与当前排队任务完全一致".to_string(),
            ));
        }
        Ok(())
    }

    /// 按给定顺序重新分配位置 0..n
    pub fn reorder(&mut self, ids: &[String]) -> Result<()> {
        self.validate_order(ids)?;
        for (position, id) in ids.iter().enumerate() {
            if let Some(entry) = self.entries.iter_mut().find(|e| &e.task_id == id) {
                entry.position = position as i64;
            }
        }
        self.entries.sort_by_key(|e| (e.position, e.seq));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pops_in_insertion_order() {
        let mut queue = DownloadQueue::new();
        assert_eq!(queue.push_back("a"), 0);
        assert_eq!(queue.push_back("b"), 1);
        assert_eq!(queue.push_back("c"), 2);
        assert_eq!(queue.pop_front().as_deref(), Some("a"));
        assert_eq!(queue.pop_front().as_deref(), Some("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn removal_does_not_renumber_others() {
        let mut queue = DownloadQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("c");
        assert!(queue.remove("b"));
        assert_eq!(queue.position_of("a"), Some(0));
        assert_eq!(queue.position_of("c"), Some(2));
        assert_eq!(queue.ids(), ids(&["a", "c"]));
        // 新任务排在现有最大位置之后
        assert_eq!(queue.push_back("d"), 3);
    }

    #[test]
    fn equal_positions_fall_back_to_insertion_order() {
        let mut queue = DownloadQueue::new();
        queue.insert("x", 5);
        queue.insert("y", 5);
        queue.insert("z", 1);
        assert_eq!(queue.ids(), ids(&["z", "x", "y"]));
    }

    #[test]
    fn reorder_replaces_positions() {
        let mut queue = DownloadQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("c");
        queue.reorder(&ids(&["c", "a", "b"])).unwrap();
        assert_eq!(queue.pop_front().as_deref(), Some("c"));
        assert_eq!(queue.position_of("a"), Some(1));
    }

    #[test]
    fn reorder_rejects_mismatched_sets() {
        let mut queue = DownloadQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        assert!(queue.reorder(&ids(&["a"])).is_err());
        assert!(queue.reorder(&ids(&["a", "b", "c"])).is_err());
        assert!(queue.reorder(&ids(&["a", "a"])).is_err());
        assert!(queue.reorder(&ids(&["a", "x"])).is_err());
        assert_eq!(queue.ids(), ids(&["a", "b"]));
    }
}
