use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use orchestrator_core::{
    Executor, ExecutorRegistry, OrchestratorError, Task, TaskStatus, WorkerPoolConfig,
    META_EXECUTOR_TASK_ID,
};
use orchestrator_dispatcher::TaskDispatcher;

/// 等待执行器响应取消请求的上限
const EXECUTOR_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次任务执行的结束方式
#[derive(Debug)]
pub struct ExecutionReport {
    /// 调度器中记录的最终状态
    pub task: Option<Task>,
    /// 执行过程中收到了停止信号
    pub shutdown_requested: bool,
}

/// 单个任务从提交到终止的完整执行过程
///
/// 执行期间的任何错误都会转换为任务的终止状态，不会向上抛出。
pub struct TaskExecutionManager {
    dispatcher: Arc<TaskDispatcher>,
    registry: Arc<dyn ExecutorRegistry>,
    status_poll_interval: Duration,
    default_timeout: Duration,
}

impl TaskExecutionManager {
    pub fn new(dispatcher: Arc<TaskDispatcher>, config: &WorkerPoolConfig) -> Self {
        Self {
            registry: dispatcher.registry(),
            dispatcher,
            status_poll_interval: config.status_poll_interval(),
            default_timeout: config.default_task_timeout(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// 执行任务并在结束时把最终状态写回调度器
    pub async fn run(
        &self,
        worker_id: usize,
        task: Task,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> ExecutionReport {
        let task_id = task.id.clone();
        info!(worker_id, task_id = %task_id, executor_id = %task.executor_id, "开始执行任务");

        let (outcome, shutdown_requested) = self.execute(task, shutdown_rx).await;
        let task = self.dispatcher.finish_task(&task_id, outcome).await;
        if task.is_none() {
            warn!(worker_id, task_id = %task_id, "任务记录已不在调度器中");
        }
        ExecutionReport {
            task,
            shutdown_requested,
        }
    }

    async fn execute(
        &self,
        task: Task,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> (Task, bool) {
        let Some(executor) = self.registry.get(&task.executor_id).await else {
            let err = OrchestratorError::ExecutorNotFound {
                executor_id: task.executor_id.clone(),
            };
            error!(task_id = %task.id, error = %err, "执行器不存在");
            return (with_status(task, TaskStatus::Error, err.to_string()), false);
        };

        // 超时从Worker取到任务时开始计算，提交耗时也计入
        let timeout = task
            .timeout_seconds()
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let mut record_rx = self.dispatcher.subscribe(&task.id).await;

        // 提交期间的取消在提交返回后处理，避免执行器侧留下无人管理的任务
        let submitted = interruptible(executor.submit(task.clone()), deadline, shutdown_rx, None).await;
        let remote_id = match submitted {
            Ok(Ok(remote_id)) => remote_id,
            Ok(Err(e)) => {
                error!(task_id = %task.id, executor_id = %task.executor_id, error = %e, "提交任务到执行器失败");
                return (
                    with_status(task, TaskStatus::Error, format!("提交任务到执行器失败: {e}")),
                    false,
                );
            }
            Err(interrupt) => {
                return self
                    .interrupted(executor.as_ref(), task, None, timeout, interrupt)
                    .await;
            }
        };
        debug!(task_id = %task.id, remote_id = %remote_id, "执行器已接收任务");

        let mut task = task;
        task.metadata.insert(
            META_EXECUTOR_TASK_ID.to_string(),
            serde_json::json!(remote_id),
        );
        let recorded_id = remote_id.clone();
        let mut cancelled_before_submit = false;
        self.dispatcher
            .update_task(&task.id, |record| {
                if record.is_terminal() {
                    cancelled_before_submit = true;
                } else {
                    record
                        .metadata
                        .insert(META_EXECUTOR_TASK_ID.to_string(), serde_json::json!(recorded_id));
                }
            })
            .await;

        if cancelled_before_submit {
            info!(task_id = %task.id, "任务在提交期间被取消");
            self.cancel_at_executor(executor.as_ref(), &task, &remote_id)
                .await;
            let record = record_rx
                .as_ref()
                .map(|rx| rx.borrow().clone())
                .unwrap_or_else(|| with_status(task.clone(), TaskStatus::Cancelled, "任务已取消"));
            return (record, false);
        }

        loop {
            // 运行中被取消时执行器已由调度器通知
            if let Some(record) = record_rx
                .as_ref()
                .map(|rx| rx.borrow().clone())
                .filter(|record| record.is_terminal())
            {
                return (record, false);
            }

            let status = match interruptible(
                executor.status(&remote_id),
                deadline,
                shutdown_rx,
                record_rx.as_mut(),
            )
            .await
            {
                Ok(status) => status,
                Err(interrupt) => {
                    return self
                        .interrupted(executor.as_ref(), task, Some(remote_id.as_str()), timeout, interrupt)
                        .await;
                }
            };

            match status {
                Ok(Some(remote)) if remote.is_terminal() => {
                    return (merge_remote(task, remote), false);
                }
                Ok(Some(remote)) => {
                    let progress = remote.progress;
                    if (progress - task.progress).abs() > f64::EPSILON {
                        task.progress = progress;
                        self.dispatcher
                            .update_task(&task.id, |record| {
                                record.progress = progress.clamp(0.0, 100.0);
                            })
                            .await;
                    }
                }
                Ok(None) => {
                    warn!(task_id = %task.id, remote_id = %remote_id, "执行器未找到任务");
                    return (
                        with_status(task, TaskStatus::Error, format!("执行器未找到任务: {remote_id}")),
                        false,
                    );
                }
                Err(e) => {
                    error!(task_id = %task.id, remote_id = %remote_id, error = %e, "查询执行器状态失败");
                    return (
                        with_status(task, TaskStatus::Error, format!("查询执行器状态失败: {e}")),
                        false,
                    );
                }
            }

            if Instant::now() >= deadline {
                return self
                    .interrupted(executor.as_ref(), task, Some(remote_id.as_str()), timeout, Interrupt::Deadline)
                    .await;
            }

            let next_poll = Instant::now() + self.status_poll_interval;
            if let Err(interrupt) =
                interruptible(sleep_until(next_poll), deadline, shutdown_rx, record_rx.as_mut()).await
            {
                return self
                    .interrupted(executor.as_ref(), task, Some(remote_id.as_str()), timeout, interrupt)
                    .await;
            }
        }
    }

    /// 把中断转换为任务终止状态，执行器已接收任务时先请求取消
    async fn interrupted(
        &self,
        executor: &dyn Executor,
        task: Task,
        remote_id: Option<&str>,
        timeout: Duration,
        interrupt: Interrupt,
    ) -> (Task, bool) {
        match interrupt {
            Interrupt::Deadline => {
                warn!(task_id = %task.id, timeout_secs = timeout.as_secs_f64(), "任务执行超时");
                if let Some(remote_id) = remote_id {
                    self.cancel_at_executor(executor, &task, remote_id).await;
                }
                let message = format!("任务执行超时（{}秒）", timeout.as_secs_f64());
                (with_status(task, TaskStatus::Timeout, message), false)
            }
            Interrupt::Shutdown => {
                info!(task_id = %task.id, "收到停止信号，取消执行中的任务");
                if let Some(remote_id) = remote_id {
                    self.cancel_at_executor(executor, &task, remote_id).await;
                }
                (
                    with_status(task, TaskStatus::Cancelled, "Worker池关闭，任务已取消"),
                    true,
                )
            }
            Interrupt::Terminated(record) => (record, false),
        }
    }

    async fn cancel_at_executor(&self, executor: &dyn Executor, task: &Task, remote_id: &str) {
        match tokio::time::timeout(EXECUTOR_CANCEL_TIMEOUT, executor.cancel(remote_id)).await {
            Ok(Ok(true)) => debug!(task_id = %task.id, remote_id = %remote_id, "执行器已取消任务"),
            Ok(Ok(false)) => warn!(task_id = %task.id, remote_id = %remote_id, "执行器拒绝取消任务"),
            Ok(Err(e)) => error!(task_id = %task.id, remote_id = %remote_id, error = %e, "执行器取消任务失败"),
            Err(_) => warn!(task_id = %task.id, remote_id = %remote_id, "执行器取消请求超时"),
        }
    }
}

/// 执行器调用被打断的原因
#[derive(Debug)]
enum Interrupt {
    Deadline,
    Shutdown,
    /// 调度器中的记录已终止
    Terminated(Task),
}

/// 执行 `call`，截止时间、停止信号或记录终止任一先到即放弃
async fn interruptible<F: Future>(
    call: F,
    deadline: Instant,
    shutdown_rx: &mut broadcast::Receiver<()>,
    record_rx: Option<&mut watch::Receiver<Task>>,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        output = timeout_at(deadline, call) => output.map_err(|_| Interrupt::Deadline),
        _ = shutdown_rx.recv() => Err(Interrupt::Shutdown),
        record = wait_record_terminal(record_rx) => Err(Interrupt::Terminated(record)),
    }
}

fn with_status(mut task: Task, status: TaskStatus, error: impl Into<String>) -> Task {
    task.status = status;
    task.set_error(error);
    task
}

fn merge_remote(mut task: Task, remote: Task) -> Task {
    task.status = remote.status;
    task.progress = remote.progress;
    task.result = remote.result;
    task.error = remote.error;
    task
}

async fn wait_record_terminal(record_rx: Option<&mut watch::Receiver<Task>>) -> Task {
    if let Some(rx) = record_rx {
        if let Ok(task) = rx.wait_for(|task| task.is_terminal()).await {
            return task.clone();
        }
    }
    std::future::pending().await
}
