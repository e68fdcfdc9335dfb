use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    rank: u8,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// 待执行任务队列
///
/// 默认严格先进先出；开启 `priority_ordering` 后优先级高的先出队，同优先级内先进先出。
/// 队列只保存任务ID，任务记录本身由调度器持有。
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    priority_ordering: bool,
}

impl TaskQueue {
    pub fn new(priority_ordering: bool) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            priority_ordering,
        }
    }

    pub fn push(&self, task_id: impl Into<String>, priority: u8) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let rank = if self.priority_ordering { priority } else { 0 };
            inner.heap.push(QueueEntry {
                rank,
                seq,
                task_id: task_id.into(),
            });
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.heap.pop().map(|entry| entry.task_id)
    }

    /// 出队，队列为空时最多等待 `timeout`
    pub async fn pop_wait(&self, timeout: Duration) -> Option<String> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(task_id) = self.pop() {
            return Some(task_id);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.pop()
    }

    /// 清空队列，返回其中的任务ID（按出队顺序）
    pub fn drain(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            drained.push(entry.task_id);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
