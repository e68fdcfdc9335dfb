use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use orchestrator_core::{OrchestratorError, OrchestratorResult, WorkerPoolConfig};
use orchestrator_dispatcher::TaskDispatcher;

use super::TaskExecutionManager;

/// 固定大小的Worker池
///
/// 每个Worker是一个常驻循环，逐个从调度器取任务执行，不会为单个任务新建Worker。
pub struct WorkerPool {
    worker_count: usize,
    queue_poll_interval: Duration,
    execution: Arc<TaskExecutionManager>,
    shutdown_tx: broadcast::Sender<()>,
    handles: RwLock<Vec<JoinHandle<()>>>,
    is_running: RwLock<bool>,
    busy_workers: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<TaskDispatcher>, config: &WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            worker_count: config.worker_count,
            queue_poll_interval: config.queue_poll_interval(),
            execution: Arc::new(TaskExecutionManager::new(dispatcher, config)),
            shutdown_tx,
            handles: RwLock::new(Vec::new()),
            is_running: RwLock::new(false),
            busy_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn builder(dispatcher: Arc<TaskDispatcher>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(dispatcher)
    }

    pub async fn start(&self) -> OrchestratorResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(OrchestratorError::Internal("Worker池已在运行".to_string()));
        }

        let mut handles = self.handles.write().await;
        for worker_id in 0..self.worker_count {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let execution = Arc::clone(&self.execution);
            let busy_workers = Arc::clone(&self.busy_workers);
            let poll_interval = self.queue_poll_interval;
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, execution, shutdown_rx, poll_interval, busy_workers).await;
            }));
        }

        *is_running = true;
        info!(worker_count = self.worker_count, "Worker池已启动");
        Ok(())
    }

    /// 发送停止信号并等待所有Worker退出，执行中的任务会被取消
    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return;
        }

        info!("停止Worker池");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.write().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker异常退出");
            }
        }

        *is_running = false;
        info!("Worker池已停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// 正在执行任务的Worker数
    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::SeqCst)
    }
}

async fn worker_loop(
    worker_id: usize,
    execution: Arc<TaskExecutionManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    busy_workers: Arc<AtomicUsize>,
) {
    debug!(worker_id, "Worker启动");
    loop {
        let next = tokio::select! {
            task = execution.dispatcher().next_task(poll_interval) => task,
            _ = shutdown_rx.recv() => {
                debug!(worker_id, "Worker收到停止信号");
                break;
            }
        };
        let Some(task) = next else {
            continue;
        };

        busy_workers.fetch_add(1, Ordering::SeqCst);
        let report = execution.run(worker_id, task, &mut shutdown_rx).await;
        busy_workers.fetch_sub(1, Ordering::SeqCst);

        if report.shutdown_requested {
            debug!(worker_id, "Worker在执行任务时收到停止信号");
            break;
        }
    }
    debug!(worker_id, "Worker退出");
}

/// Worker池构建器
pub struct WorkerPoolBuilder {
    dispatcher: Arc<TaskDispatcher>,
    config: WorkerPoolConfig,
}

impl WorkerPoolBuilder {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            config: WorkerPoolConfig::default(),
        }
    }

    pub fn config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count;
        self
    }

    pub fn queue_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.queue_poll_interval_ms = interval_ms;
        self
    }

    pub fn status_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.status_poll_interval_ms = interval_ms;
        self
    }

    pub fn default_task_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.default_task_timeout_seconds = seconds;
        self
    }

    pub fn build(self) -> OrchestratorResult<WorkerPool> {
        self.config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        Ok(WorkerPool::new(self.dispatcher, &self.config))
    }
}
