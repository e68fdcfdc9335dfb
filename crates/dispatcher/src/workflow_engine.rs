//! 工作流驱动
//!
//! 每个工作流由一个独立的驱动任务推进：计算就绪集合，把集合内的步骤作为普通任务
//! 并发提交给调度器，等这一批全部终止后再计算下一批。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use orchestrator_core::{
    Clock, EngineEvent, EventBus, OrchestratorError, OrchestratorResult, Task, TaskStatus,
    Workflow, WorkflowConfig, WorkflowStatus, WorkflowStep, WorkflowView, META_STEP_ID,
    META_WORKFLOW_ID,
};

use crate::dependency_checker::{plan_next_batch, BatchPlan, DependencyChecker};
use crate::dispatcher::TaskDispatcher;

struct WorkflowEntry {
    workflow: Workflow,
    cancel_tx: watch::Sender<bool>,
    /// 驱动任务退出的时间，之后才允许淘汰
    finished_at: Option<DateTime<Utc>>,
}

/// 单个步骤一轮执行的结果
#[derive(Debug)]
enum StepOutcome {
    Finished(Task),
    TimedOut(u64),
    Cancelled,
    Internal(String),
}

#[derive(Clone)]
pub struct WorkflowEngine {
    dispatcher: Arc<TaskDispatcher>,
    checker: Arc<DependencyChecker>,
    workflows: Arc<RwLock<HashMap<String, WorkflowEntry>>>,
    drivers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
    accepting: Arc<AtomicBool>,
}

impl WorkflowEngine {
    pub fn new(dispatcher: Arc<TaskDispatcher>, config: WorkflowConfig) -> Self {
        Self {
            checker: Arc::new(DependencyChecker::new(dispatcher.registry())),
            events: dispatcher.events(),
            clock: dispatcher.clock(),
            dispatcher,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            drivers: Arc::new(Mutex::new(Vec::new())),
            config,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 校验并启动工作流，返回工作流ID
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> OrchestratorResult<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        self.checker.validate(&workflow).await?;

        workflow.status = WorkflowStatus::Created;
        workflow.progress = 0.0;
        workflow.error = None;
        workflow.created_at = self.clock.now();
        workflow.started_at = None;
        workflow.completed_at = None;
        for step in workflow.steps.iter_mut() {
            step.status = TaskStatus::Pending;
            step.result = None;
            step.error = None;
            step.task_id = None;
            step.started_at = None;
            step.completed_at = None;
        }

        let workflow_id = workflow.id.clone();
        let step_count = workflow.steps.len();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut workflows = self.workflows.write().await;
            self.evict_finished(&mut workflows);
            if workflows.contains_key(&workflow_id) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "工作流ID已存在: {workflow_id}"
                )));
            }
            workflows.insert(
                workflow_id.clone(),
                WorkflowEntry {
                    workflow,
                    cancel_tx,
                    finished_at: None,
                },
            );
        }

        info!(workflow_id = %workflow_id, step_count, "工作流已提交");
        self.events.emit(EngineEvent::WorkflowSubmitted {
            workflow_id: workflow_id.clone(),
            step_count,
            occurred_at: self.clock.now(),
        });

        let engine = self.clone();
        let driver_id = workflow_id.clone();
        let handle = tokio::spawn(async move {
            engine.drive(driver_id, cancel_rx).await;
        });

        let mut drivers = self.drivers.lock().await;
        drivers.retain(|handle| !handle.is_finished());
        drivers.push(handle);

        Ok(workflow_id)
    }

    async fn drive(&self, workflow_id: String, cancel_rx: watch::Receiver<bool>) {
        let now = self.clock.now();
        let started = self
            .with_workflow(&workflow_id, |workflow| {
                if workflow.status == WorkflowStatus::Created {
                    workflow.status = WorkflowStatus::Running;
                    workflow.started_at = Some(now);
                }
                workflow.status == WorkflowStatus::Running
            })
            .await
            .unwrap_or(false);

        if started {
            info!(workflow_id = %workflow_id, "工作流开始执行");
            self.run_batches(&workflow_id, &cancel_rx).await;
        }

        let finished = self
            .with_workflow(&workflow_id, |workflow| {
                (workflow.status, workflow.progress)
            })
            .await;
        if let Some((status, progress)) = finished {
            info!(workflow_id = %workflow_id, status = %status, progress, "工作流结束");
            let now = self.clock.now();
            {
                let mut workflows = self.workflows.write().await;
                if let Some(entry) = workflows.get_mut(&workflow_id) {
                    entry.finished_at = Some(now);
                }
                self.evict_finished(&mut workflows);
            }
            self.events.emit(EngineEvent::WorkflowFinished {
                workflow_id: workflow_id.clone(),
                status,
                occurred_at: now,
            });
        }
    }

    /// 淘汰超过保留时间或超出数量上限的已结束工作流，先结束的先淘汰
    fn evict_finished(&self, workflows: &mut HashMap<String, WorkflowEntry>) {
        let now = self.clock.now();
        let retention = chrono::Duration::seconds(self.config.finished_retention_seconds as i64);
        workflows.retain(|_, entry| entry.finished_at.map_or(true, |at| now - at <= retention));

        let mut finished: Vec<(DateTime<Utc>, String)> = workflows
            .iter()
            .filter_map(|(id, entry)| entry.finished_at.map(|at| (at, id.clone())))
            .collect();
        if finished.len() <= self.config.max_finished_workflows {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.config.max_finished_workflows;
        for (_, workflow_id) in finished.into_iter().take(excess) {
            workflows.remove(&workflow_id);
        }
    }

    async fn run_batches(&self, workflow_id: &str, cancel_rx: &watch::Receiver<bool>) {
        loop {
            let Some(plan) = self
                .with_workflow(workflow_id, |workflow| {
                    if workflow.status.is_terminal() {
                        None
                    } else {
                        Some(plan_next_batch(workflow))
                    }
                })
                .await
                .flatten()
            else {
                return;
            };

            let ready = match plan {
                BatchPlan::Ready(ready) => ready,
                BatchPlan::Finished => {
                    let now = self.clock.now();
                    self.with_workflow(workflow_id, |workflow| {
                        workflow.recompute_progress();
                        let status = workflow.aggregate_status();
                        if status == WorkflowStatus::Failed {
                            let failed: Vec<&str> = workflow
                                .steps
                                .iter()
                                .filter(|step| step.status.is_failure())
                                .map(|step| step.id.as_str())
                                .collect();
                            workflow.error = Some(format!("步骤执行失败: {}", failed.join(", ")));
                        }
                        workflow.status = status;
                        workflow.completed_at = Some(now);
                    })
                    .await;
                    return;
                }
                BatchPlan::Stuck(blocked) => {
                    let now = self.clock.now();
                    warn!(workflow_id = %workflow_id, blocked = ?blocked, "工作流无法继续推进");
                    self.with_workflow(workflow_id, |workflow| {
                        workflow.recompute_progress();
                        workflow.status = WorkflowStatus::Failed;
                        workflow.error =
                            Some(format!("工作流卡住，以下步骤无法就绪: {}", blocked.join(", ")));
                        workflow.completed_at = Some(now);
                    })
                    .await;
                    return;
                }
            };

            let Some(steps) = self.start_batch(workflow_id, &ready).await else {
                return;
            };

            let outcomes = join_all(
                steps
                    .into_iter()
                    .map(|(step, requester_id)| {
                        let cancel_rx = cancel_rx.clone();
                        async move {
                            let outcome =
                                self.run_step(workflow_id, &requester_id, &step, cancel_rx).await;
                            (step.id, outcome)
                        }
                    }),
            )
            .await;

            let internal_errors = self.record_batch(workflow_id, outcomes).await;
            if !internal_errors.is_empty() {
                let now = self.clock.now();
                error!(workflow_id = %workflow_id, errors = ?internal_errors, "工作流内部错误");
                self.with_workflow(workflow_id, |workflow| {
                    if workflow.status.is_terminal() {
                        return;
                    }
                    for step in workflow.steps.iter_mut() {
                        if step.status == TaskStatus::Pending {
                            step.status = TaskStatus::Cancelled;
                            step.completed_at = Some(now);
                        }
                    }
                    workflow.recompute_progress();
                    workflow.status = WorkflowStatus::Error;
                    workflow.error = Some(internal_errors.join("; "));
                    workflow.completed_at = Some(now);
                })
                .await;
                return;
            }
        }
    }

    /// 把就绪步骤标记为运行中，返回步骤快照
    async fn start_batch(
        &self,
        workflow_id: &str,
        ready: &[String],
    ) -> Option<Vec<(WorkflowStep, String)>> {
        let now = self.clock.now();
        self.with_workflow(workflow_id, |workflow| {
            if workflow.status.is_terminal() {
                return None;
            }
            let requester_id = workflow.requester_id.clone();
            let mut started = Vec::with_capacity(ready.len());
            for step_id in ready {
                if let Some(step) = workflow.step_mut(step_id) {
                    step.status = TaskStatus::Running;
                    step.task_id = Some(step_task_id(workflow_id, step_id));
                    step.started_at = Some(now);
                    started.push((step.clone(), requester_id.clone()));
                }
            }
            Some(started)
        })
        .await
        .flatten()
    }

    async fn run_step(
        &self,
        workflow_id: &str,
        requester_id: &str,
        step: &WorkflowStep,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> StepOutcome {
        let timeout_secs = if step.timeout == 0 {
            self.config.default_step_timeout_seconds
        } else {
            step.timeout
        };

        let mut task = Task::new(step.executor_id.clone(), step.task_type.clone())
            .with_id(step_task_id(workflow_id, &step.id))
            .with_requester(requester_id)
            .with_timeout_seconds(timeout_secs)
            .with_metadata(META_WORKFLOW_ID, serde_json::json!(workflow_id))
            .with_metadata(META_STEP_ID, serde_json::json!(step.id));
        task.parameters = step.parameters.clone();

        let task_id = match self.dispatcher.submit_task(task).await {
            Ok(task_id) => task_id,
            Err(e) => {
                return StepOutcome::Internal(format!("步骤 {} 提交失败: {}", step.id, e));
            }
        };

        // 步骤预算从Worker开始执行时计算，排队时间不计入
        let started = tokio::select! {
            started = self.dispatcher.wait_until_started(&task_id) => started,
            _ = wait_cancelled(&mut cancel_rx) => {
                return self.cancel_step_task(workflow_id, step, &task_id, timeout_secs).await;
            }
        };
        if let Some(task) = started.filter(|task| task.is_terminal()) {
            return StepOutcome::Finished(task);
        }

        let wait = self.step_budget(timeout_secs);
        tokio::select! {
            finished = self.dispatcher.wait_for_terminal(&task_id, wait) => match finished {
                Some(task) => StepOutcome::Finished(task),
                None => {
                    warn!(workflow_id = %workflow_id, step_id = %step.id, task_id = %task_id, "等待步骤超时，以超时结束任务");
                    let message = format!("步骤在 {timeout_secs} 秒内未完成");
                    self.dispatcher.expire_task(&task_id, &message).await;
                    self.settle(&task_id, timeout_secs, StepOutcome::TimedOut(timeout_secs))
                        .await
                }
            },
            _ = wait_cancelled(&mut cancel_rx) => {
                self.cancel_step_task(workflow_id, step, &task_id, timeout_secs).await
            }
        }
    }

    fn step_budget(&self, timeout_secs: u64) -> Duration {
        Duration::from_secs(timeout_secs) + Duration::from_millis(self.config.step_wait_grace_ms)
    }

    /// 取消步骤任务，步骤结果以任务的真实终止状态为准
    async fn cancel_step_task(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        task_id: &str,
        timeout_secs: u64,
    ) -> StepOutcome {
        if !self.dispatcher.cancel_task(task_id).await {
            let terminal = self
                .dispatcher
                .get_task(task_id)
                .await
                .map(|task| task.is_terminal())
                .unwrap_or(true);
            if !terminal {
                warn!(workflow_id = %workflow_id, step_id = %step.id, task_id = %task_id, "执行器拒绝取消，等待任务自行结束");
            }
        }
        self.settle(task_id, timeout_secs, StepOutcome::Cancelled).await
    }

    /// 等待任务终止并返回其记录，超出步骤预算时使用 `fallback`
    async fn settle(&self, task_id: &str, timeout_secs: u64, fallback: StepOutcome) -> StepOutcome {
        match self
            .dispatcher
            .wait_for_terminal(task_id, self.step_budget(timeout_secs))
            .await
        {
            Some(task) => StepOutcome::Finished(task),
            None => fallback,
        }
    }

    /// 写回本批步骤的结果，返回内部错误描述
    async fn record_batch(
        &self,
        workflow_id: &str,
        outcomes: Vec<(String, StepOutcome)>,
    ) -> Vec<String> {
        let now = self.clock.now();
        self.with_workflow(workflow_id, |workflow| {
            let mut internal_errors = Vec::new();
            for (step_id, outcome) in outcomes {
                let Some(step) = workflow.step_mut(&step_id) else {
                    continue;
                };
                match outcome {
                    StepOutcome::Finished(task) => {
                        step.status = task.status;
                        step.result = task.result;
                        step.error = task.error;
                        step.completed_at = task.completed_at.or(Some(now));
                    }
                    StepOutcome::TimedOut(timeout_secs) => {
                        step.status = TaskStatus::Timeout;
                        step.result = None;
                        step.error = Some(format!("步骤在 {timeout_secs} 秒内未完成"));
                        step.completed_at = Some(now);
                    }
                    StepOutcome::Cancelled => {
                        step.status = TaskStatus::Cancelled;
                        step.result = None;
                        step.error = Some("工作流已取消".to_string());
                        step.completed_at = Some(now);
                    }
                    StepOutcome::Internal(message) => {
                        step.status = TaskStatus::Error;
                        step.result = None;
                        step.error = Some(message.clone());
                        step.completed_at = Some(now);
                        internal_errors.push(message);
                    }
                }
            }
            workflow.recompute_progress();
            internal_errors
        })
        .await
        .unwrap_or_default()
    }

    async fn with_workflow<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut Workflow) -> R,
    ) -> Option<R> {
        let mut workflows = self.workflows.write().await;
        workflows
            .get_mut(workflow_id)
            .map(|entry| f(&mut entry.workflow))
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        let mut workflows = self.workflows.write().await;
        self.evict_finished(&mut workflows);
        workflows
            .get(workflow_id)
            .map(|entry| entry.workflow.clone())
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowView> {
        self.get_workflow(workflow_id)
            .await
            .map(|workflow| WorkflowView::from(&workflow))
    }

    /// 仍在工作流表中的工作流数（含已结束但未淘汰的）
    pub async fn tracked_workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    /// 取消工作流
    ///
    /// 未知或已终止的工作流返回 `false`。运行中的步骤通过其任务取消，
    /// 待执行的步骤直接标记为取消，已终止的步骤保持不变。
    pub async fn cancel_workflow(&self, workflow_id: &str) -> bool {
        let now = self.clock.now();
        let running_steps = {
            let mut workflows = self.workflows.write().await;
            let Some(entry) = workflows.get_mut(workflow_id) else {
                return false;
            };
            if entry.workflow.status.is_terminal() {
                return false;
            }

            let workflow = &mut entry.workflow;
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(now);
            let mut running = Vec::new();
            for step in workflow.steps.iter_mut() {
                match step.status {
                    TaskStatus::Pending => {
                        step.status = TaskStatus::Cancelled;
                        step.completed_at = Some(now);
                    }
                    TaskStatus::Running => running.push(step.id.clone()),
                    _ => {}
                }
            }
            workflow.recompute_progress();
            running
        };

        for step_id in &running_steps {
            if let Some(task) = self.dispatcher.find_task_for_step(workflow_id, step_id).await {
                if !self.dispatcher.cancel_task(&task.id).await {
                    warn!(workflow_id = %workflow_id, step_id = %step_id, task_id = %task.id, "步骤任务取消失败");
                }
            }
        }

        if let Some(entry) = self.workflows.read().await.get(workflow_id) {
            entry.cancel_tx.send_replace(true);
        }
        info!(workflow_id = %workflow_id, running = running_steps.len(), "工作流已取消");
        true
    }

    pub async fn active_workflow_count(&self) -> usize {
        self.workflows
            .read()
            .await
            .values()
            .filter(|entry| !entry.workflow.status.is_terminal())
            .count()
    }

    /// 停止接收新工作流，取消所有运行中的工作流并等待驱动任务退出
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let active: Vec<String> = self
            .workflows
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.workflow.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for workflow_id in &active {
            self.cancel_workflow(workflow_id).await;
        }

        let handles: Vec<JoinHandle<()>> = self.drivers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "工作流驱动任务异常退出");
            }
        }
        info!(cancelled = active.len(), "工作流引擎已停止");
    }
}

fn step_task_id(workflow_id: &str, step_id: &str) -> String {
    format!("{workflow_id}_{step_id}")
}

async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let closed = cancel_rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
