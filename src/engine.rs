//! 编排引擎门面
//!
//! 把执行器注册表、任务调度器、Worker池、工作流引擎和指标汇总组装成一个实例。
//! 依赖全部在构造时注入，进程内可以同时存在多个互不干扰的引擎。

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::info;

use orchestrator_core::{
    Clock, DefaultExecutorRegistry, EngineConfig, EngineEvent, EngineEventListener, EngineState,
    EngineStatusView, EventBus, Executor, ExecutorRegistry, MetricsAggregator, OrchestratorError,
    OrchestratorResult, SystemClock, Task, TaskView, Workflow, WorkflowView,
};
use orchestrator_dispatcher::{TaskDispatcher, WorkflowEngine};
use orchestrator_worker::WorkerPool;

pub struct OrchestrationEngine {
    config: EngineConfig,
    registry: Arc<dyn ExecutorRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsAggregator>,
    dispatcher: Arc<TaskDispatcher>,
    workflows: WorkflowEngine,
    workers: WorkerPool,
    state: RwLock<EngineState>,
}

impl OrchestrationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    async fn ensure_running(&self) -> OrchestratorResult<()> {
        if *self.state.read().await != EngineState::Running {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    pub async fn submit_task(&self, task: Task) -> OrchestratorResult<String> {
        self.ensure_running().await?;
        self.dispatcher.submit_task(task).await
    }

    pub async fn submit_workflow(&self, workflow: Workflow) -> OrchestratorResult<String> {
        self.ensure_running().await?;
        self.workflows.submit_workflow(workflow).await
    }

    pub async fn get_task_status(&self, task_id: &str) -> Option<TaskView> {
        self.dispatcher.get_task_status(task_id).await
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowView> {
        self.workflows.get_workflow_status(workflow_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.dispatcher.cancel_task(task_id).await
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> bool {
        self.workflows.cancel_workflow(workflow_id).await
    }

    pub async fn get_engine_status(&self) -> EngineStatusView {
        EngineStatusView {
            status: *self.state.read().await,
            active_tasks: self.dispatcher.active_task_count().await,
            active_workflows: self.workflows.active_workflow_count().await,
            queue_depth: self.dispatcher.queue_depth().await,
            metrics: self.metrics.snapshot(),
        }
    }

    /// 订阅生命周期事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> Arc<dyn ExecutorRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 关闭引擎
    ///
    /// 停止接收新工作，取消运行中的工作流和排队中的任务，停止Worker池并等待全部退出。
    /// 重复调用直接返回。
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::ShuttingDown;
        }
        info!("开始关闭编排引擎");

        self.workflows.shutdown().await;
        self.dispatcher.stop_accepting();
        let cancelled = self.dispatcher.cancel_all_pending().await;
        self.workers.stop().await;

        *self.state.write().await = EngineState::Stopped;
        info!(cancelled_pending = cancelled, "编排引擎已关闭");
    }
}

/// 引擎构建器
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<dyn ExecutorRegistry>>,
    executors: Vec<(String, Arc<dyn Executor>)>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: None,
            executors: Vec::new(),
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 使用外部注册表，默认创建 [`DefaultExecutorRegistry`]
    pub fn registry(mut self, registry: Arc<dyn ExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn executor(mut self, id: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.push((id.into(), executor));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 组装组件并启动Worker池
    pub async fn build(self) -> OrchestratorResult<OrchestrationEngine> {
        self.config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(format!("{e:#}")))?;

        let registry: Arc<dyn ExecutorRegistry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(DefaultExecutorRegistry::new()),
        };
        for (id, executor) in self.executors {
            registry.register(id, executor).await;
        }

        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsAggregator::new(self.clock.clone()));
        events.add_listener(metrics.clone());
        for listener in self.listeners {
            events.add_listener(listener);
        }

        let dispatcher = Arc::new(TaskDispatcher::new(
            registry.clone(),
            events.clone(),
            self.clock.clone(),
            self.config.dispatcher.clone(),
        ));
        let workflows = WorkflowEngine::new(dispatcher.clone(), self.config.workflow.clone());
        let workers = WorkerPool::new(dispatcher.clone(), &self.config.worker);
        workers.start().await?;

        info!(
            workers = self.config.worker.worker_count,
            executors = registry.count().await,
            "编排引擎已启动"
        );

        Ok(OrchestrationEngine {
            config: self.config,
            registry,
            events,
            metrics,
            dispatcher,
            workflows,
            workers,
            state: RwLock::new(EngineState::Running),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
