//! 任务调度器
//!
//! 持有所有未终止任务的实时记录，负责提交校验、入队、状态查询与取消。
//! 每条实时记录是一个 `watch` 通道，任何修改都会唤醒等待该任务的一方；
//! 任务终止后记录转入有界的已完成快照表，重复查询返回同一快照直到被淘汰。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use orchestrator_core::{
    Clock, DispatcherConfig, EngineEvent, EventBus, ExecutorRegistry, OrchestratorError,
    OrchestratorResult, Task, TaskStatus, MAX_PRIORITY, META_EXECUTOR_TASK_ID, MIN_PRIORITY,
};

use crate::task_queue::TaskQueue;

const CANCELLED_MESSAGE: &str = "任务已取消";

#[derive(Debug)]
struct FinishedTable {
    entries: HashMap<String, (Task, DateTime<Utc>)>,
    order: VecDeque<String>,
    capacity: usize,
    retention: chrono::Duration,
}

impl FinishedTable {
    fn new(config: &DispatcherConfig) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: config.max_finished_tasks,
            retention: chrono::Duration::seconds(config.finished_retention_seconds as i64),
        }
    }

    fn insert(&mut self, task: Task, now: DateTime<Utc>) {
        if self.entries.insert(task.id.clone(), (task.clone(), now)).is_some() {
            self.order.retain(|id| id != &task.id);
        }
        self.order.push_back(task.id);
        self.evict(now);
    }

    fn get(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<Task> {
        self.evict(now);
        self.entries.get(task_id).map(|(task, _)| task.clone())
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .entries
                .get(oldest)
                .map(|(_, finished_at)| now - *finished_at > self.retention)
                .unwrap_or(true);
            if !expired && self.order.len() <= self.capacity {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.remove(&id);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct TaskDispatcher {
    registry: Arc<dyn ExecutorRegistry>,
    queue: TaskQueue,
    live: RwLock<HashMap<String, watch::Sender<Task>>>,
    finished: Mutex<FinishedTable>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    accepting: AtomicBool,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<dyn ExecutorRegistry>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            queue: TaskQueue::new(config.priority_ordering),
            live: RwLock::new(HashMap::new()),
            finished: Mutex::new(FinishedTable::new(&config)),
            events,
            clock,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn registry(&self) -> Arc<dyn ExecutorRegistry> {
        self.registry.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    async fn validate_task(&self, task: &Task) -> OrchestratorResult<()> {
        if task.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask("任务ID不能为空".to_string()));
        }
        if task.executor_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask("执行器ID不能为空".to_string()));
        }
        if task.task_type.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask("任务类型不能为空".to_string()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&task.priority) {
            return Err(OrchestratorError::InvalidTask(format!(
                "任务优先级必须在 {MIN_PRIORITY}-{MAX_PRIORITY} 之间，当前为 {}",
                task.priority
            )));
        }

        let executor = self.registry.get(&task.executor_id).await.ok_or_else(|| {
            OrchestratorError::UnknownExecutor {
                executor_id: task.executor_id.clone(),
            }
        })?;
        if !executor.supports_task_type(&task.task_type) {
            return Err(OrchestratorError::UnsupportedTaskType {
                executor_id: task.executor_id.clone(),
                task_type: task.task_type.clone(),
            });
        }
        Ok(())
    }

    /// 校验并入队任务，返回任务ID
    pub async fn submit_task(&self, mut task: Task) -> OrchestratorResult<String> {
        if !self.is_accepting() {
            return Err(OrchestratorError::ShuttingDown);
        }
        self.validate_task(&task).await?;

        task.status = TaskStatus::Pending;
        task.progress = 0.0;
        task.result = None;
        task.error = None;
        task.started_at = None;
        task.completed_at = None;
        task.metadata.remove(META_EXECUTOR_TASK_ID);
        task.created_at = self.clock.now();

        let task_id = task.id.clone();
        let priority = task.priority;
        let executor_id = task.executor_id.clone();
        let task_type = task.task_type.clone();

        {
            let mut live = self.live.write().await;
            if live.contains_key(&task_id) {
                return Err(OrchestratorError::InvalidTask(format!(
                    "任务ID已存在: {task_id}"
                )));
            }
            let (sender, _) = watch::channel(task);
            live.insert(task_id.clone(), sender);
        }
        self.queue.push(task_id.clone(), priority);

        info!(task_id = %task_id, executor_id = %executor_id, task_type = %task_type, "任务已提交");
        self.events.emit(EngineEvent::TaskSubmitted {
            task_id: task_id.clone(),
            executor_id,
            task_type,
            occurred_at: self.clock.now(),
        });
        Ok(task_id)
    }

    /// 调度器自身持有的记录（实时表或已完成表）
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        if let Some(sender) = self.live.read().await.get(task_id) {
            return Some(sender.borrow().clone());
        }
        self.finished.lock().await.get(task_id, self.clock.now())
    }

    /// 查询任务状态，调度器不再持有时依次询问各执行器
    pub async fn get_task_status(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.get_task(task_id).await {
            return Some(task);
        }
        for (executor_id, executor) in self.registry.all().await {
            match executor.status(task_id).await {
                Ok(Some(task)) => return Some(task),
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task_id, executor_id = %executor_id, error = %e, "执行器状态查询失败");
                }
            }
        }
        None
    }

    pub async fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<Task>> {
        self.live
            .read()
            .await
            .get(task_id)
            .map(|sender| sender.subscribe())
    }

    /// 等待任务离开排队状态，返回此刻的记录
    ///
    /// 调度器不再持有该任务时返回已完成表中的快照（或 `None`）。
    pub async fn wait_until_started(&self, task_id: &str) -> Option<Task> {
        let Some(mut receiver) = self.subscribe(task_id).await else {
            return self.get_task(task_id).await;
        };
        let started = match receiver.wait_for(|task| task.status != TaskStatus::Pending).await {
            Ok(task) => Some(task.clone()),
            Err(_) => None,
        };
        match started {
            Some(task) => Some(task),
            None => self.get_task(task_id).await,
        }
    }

    /// 等待任务进入终止状态，超时返回 `None`
    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Option<Task> {
        let Some(mut receiver) = self.subscribe(task_id).await else {
            return self
                .get_task(task_id)
                .await
                .filter(|task| task.is_terminal());
        };

        let waited = tokio::time::timeout(timeout, async {
            match receiver.wait_for(|task| task.is_terminal()).await {
                Ok(task) => Some(task.clone()),
                Err(_) => None,
            }
        })
        .await;

        match waited {
            Ok(Some(task)) => Some(task),
            Ok(None) => self
                .get_task(task_id)
                .await
                .filter(|task| task.is_terminal()),
            Err(_) => None,
        }
    }

    /// Worker取下一个待执行任务并标记为运行中
    ///
    /// 已被取消或不再由调度器持有的任务ID会被跳过。
    pub async fn next_task(&self, poll_interval: Duration) -> Option<Task> {
        loop {
            let task_id = self.queue.pop_wait(poll_interval).await?;
            let live = self.live.read().await;
            let Some(sender) = live.get(&task_id) else {
                debug!(task_id = %task_id, "任务已不在实时表中，跳过");
                continue;
            };

            let now = self.clock.now();
            let mut started = false;
            sender.send_if_modified(|task| {
                started = task.status == TaskStatus::Pending && task.transition(TaskStatus::Running, now);
                started
            });
            if !started {
                continue;
            }

            let task = sender.borrow().clone();
            drop(live);
            self.events.emit(EngineEvent::TaskStarted {
                task_id: task.id.clone(),
                executor_id: task.executor_id.clone(),
                occurred_at: now,
            });
            return Some(task);
        }
    }

    /// 修改实时记录，任务不存在时返回 `false`
    pub async fn update_task<F>(&self, task_id: &str, modify: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        match self.live.read().await.get(task_id) {
            Some(sender) => {
                sender.send_modify(modify);
                true
            }
            None => false,
        }
    }

    /// 写入最终状态，并把记录从实时表移到已完成表
    ///
    /// 记录已处于终止状态（例如运行中被取消）时保留原状态。返回最终记录。
    pub async fn finish_task(&self, task_id: &str, outcome: Task) -> Option<Task> {
        let now = self.clock.now();
        let final_task = {
            let live = self.live.read().await;
            let sender = live.get(task_id)?;
            sender.send_modify(|task| {
                let status = if outcome.status.is_terminal() {
                    outcome.status
                } else {
                    TaskStatus::Error
                };
                if task.transition(status, now) {
                    task.progress = if status == TaskStatus::Completed {
                        100.0
                    } else {
                        outcome.progress.clamp(0.0, 100.0)
                    };
                    match (&outcome.result, &outcome.error) {
                        (_, Some(error)) => task.set_error(error.clone()),
                        (Some(result), None) => task.set_result(result.clone()),
                        (None, None) if status != TaskStatus::Completed => {
                            task.set_error(format!("任务以 {status} 状态结束"))
                        }
                        (None, None) => {}
                    }
                }
                if let Some(remote_id) = outcome.metadata.get(META_EXECUTOR_TASK_ID) {
                    task.metadata
                        .insert(META_EXECUTOR_TASK_ID.to_string(), remote_id.clone());
                }
            });
            let snapshot = sender.borrow().clone();
            snapshot
        };

        self.retire(final_task.clone(), now).await;
        Some(final_task)
    }

    async fn retire(&self, task: Task, now: DateTime<Utc>) {
        self.finished.lock().await.insert(task.clone(), now);
        self.live.write().await.remove(&task.id);

        let duration_ms = task.execution_duration_ms().unwrap_or(0).max(0) as u64;
        info!(
            task_id = %task.id,
            executor_id = %task.executor_id,
            status = %task.status,
            duration_ms,
            "任务结束"
        );
        self.events.emit(EngineEvent::TaskFinished {
            task_id: task.id.clone(),
            executor_id: task.executor_id.clone(),
            status: task.status,
            duration_ms,
            error: task.error.clone(),
            occurred_at: now,
        });
    }

    /// 取消任务
    ///
    /// 待执行的任务直接标记为取消；运行中的任务先转发给所属执行器，再转发给其余执行器，
    /// 成功后同时把调度器记录标记为取消；调度器不再持有的任务逐个询问执行器。
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self
            .terminate_task(task_id, TaskStatus::Cancelled, CANCELLED_MESSAGE)
            .await
        {
            Some(cancelled) => cancelled,
            None => self.cancel_at_executors(task_id, None).await,
        }
    }

    /// 以超时结束任务
    ///
    /// 与 [`cancel_task`](Self::cancel_task) 走相同的执行器取消路径，但记录为 `Timeout`。
    /// 调度器不再持有的任务返回 `false`。
    pub async fn expire_task(&self, task_id: &str, message: &str) -> bool {
        self.terminate_task(task_id, TaskStatus::Timeout, message)
            .await
            .unwrap_or(false)
    }

    /// 返回 `None` 表示任务不在实时表中
    async fn terminate_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: &str,
    ) -> Option<bool> {
        let now = self.clock.now();
        let local = {
            let live = self.live.read().await;
            live.get(task_id).map(|sender| {
                let mut terminated_here = false;
                sender.send_if_modified(|task| {
                    let not_submitted = task.status == TaskStatus::Pending
                        || (task.status == TaskStatus::Running
                            && !task.metadata.contains_key(META_EXECUTOR_TASK_ID));
                    if not_submitted && task.transition(status, now) {
                        task.set_error(message);
                        terminated_here = true;
                    }
                    terminated_here
                });
                let snapshot = sender.borrow().clone();
                (terminated_here, snapshot)
            })
        };

        let Some((terminated_here, snapshot)) = local else {
            return None;
        };

        if terminated_here {
            // 运行中但尚未提交给执行器的任务由其Worker负责收尾
            if snapshot.started_at.is_none() {
                self.retire(snapshot, now).await;
            }
            info!(task_id = %task_id, status = %status, "任务已在调度器中结束");
            return Some(true);
        }

        if snapshot.is_terminal() {
            return Some(false);
        }

        let remote_id = snapshot.executor_task_id().to_string();
        let cancelled = self
            .cancel_at_executors(&remote_id, Some(&snapshot.executor_id))
            .await;
        if cancelled {
            self.update_task(task_id, |task| {
                if task.transition(status, now) {
                    task.set_error(message);
                }
            })
            .await;
            info!(task_id = %task_id, executor_id = %snapshot.executor_id, status = %status, "运行中的任务已在执行器中取消");
        } else {
            warn!(task_id = %task_id, executor_id = %snapshot.executor_id, "没有执行器接受取消请求");
        }
        Some(cancelled)
    }

    async fn cancel_at_executors(&self, remote_id: &str, owner: Option<&str>) -> bool {
        if let Some(owner_id) = owner {
            if let Some(executor) = self.registry.get(owner_id).await {
                match executor.cancel(remote_id).await {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(task_id = %remote_id, executor_id = %owner_id, error = %e, "执行器取消失败");
                    }
                }
            }
        }

        for (executor_id, executor) in self.registry.all().await {
            if Some(executor_id.as_str()) == owner {
                continue;
            }
            match executor.cancel(remote_id).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(task_id = %remote_id, executor_id = %executor_id, error = %e, "执行器取消失败");
                }
            }
        }
        false
    }

    /// 按 (工作流ID, 步骤ID) 查找实时任务
    pub async fn find_task_for_step(&self, workflow_id: &str, step_id: &str) -> Option<Task> {
        self.live
            .read()
            .await
            .values()
            .map(|sender| sender.borrow().clone())
            .find(|task| task.workflow_id() == Some(workflow_id) && task.step_id() == Some(step_id))
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// 取消所有仍在排队的任务，返回取消数量
    pub async fn cancel_all_pending(&self) -> usize {
        self.queue.drain();
        let pending: Vec<String> = self
            .live
            .read()
            .await
            .iter()
            .filter(|(_, sender)| sender.borrow().status == TaskStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        let mut cancelled = 0;
        for task_id in pending {
            if self.cancel_task(&task_id).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "已取消排队中的任务");
        }
        cancelled
    }

    /// 未终止的任务数
    pub async fn active_task_count(&self) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|sender| !sender.borrow().is_terminal())
            .count()
    }

    /// 仍在排队等待Worker的任务数
    pub async fn queue_depth(&self) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|sender| sender.borrow().status == TaskStatus::Pending)
            .count()
    }

    pub async fn finished_count(&self) -> usize {
        self.finished.lock().await.len()
    }
}
