//! 执行器接口定义
//!
//! 此模块定义了任务执行后端的抽象接口，包括：
//! - 执行器接口 [`Executor`]
//! - 执行器注册表接口 [`ExecutorRegistry`]
//!
//! ## 核心概念
//!
//! ### Executor
//! 执行器是实际完成任务的可插拔后端（网页抓取、代码沙箱、金融计算、LLM调用等），
//! 编排引擎只通过提交、查询、取消三个操作与其交互。每个执行器自行管理内部排队与并发。
//!
//! ### ExecutorRegistry
//! 执行器注册表把执行器ID映射到执行器实例。启动后以读为主，可视为不可变。
//!
//! ## 实现自定义执行器
//!
//! ```rust
//! use async_trait::async_trait;
//! use orchestrator_core::{Executor, OrchestratorResult, Task};
//!
//! pub struct NoopExecutor;
//!
//! #[async_trait]
//! impl Executor for NoopExecutor {
//!     fn name(&self) -> &str {
//!         "noop"
//!     }
//!
//!     async fn submit(&self, task: Task) -> OrchestratorResult<String> {
//!         Ok(task.id)
//!     }
//!
//!     async fn status(&self, _task_id: &str) -> OrchestratorResult<Option<Task>> {
//!         Ok(None)
//!     }
//!
//!     async fn cancel(&self, _task_id: &str) -> OrchestratorResult<bool> {
//!         Ok(false)
//!     }
//!
//!     fn supports_task_type(&self, task_type: &str) -> bool {
//!         task_type == "noop"
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::{models::Task, OrchestratorResult};

/// 执行器核心接口
///
/// # 线程安全
///
/// 此trait要求实现 `Send + Sync`，同一个执行器实例会被多个worker并发调用。
///
/// # 错误约定
///
/// `submit` / `status` 返回 `Err` 表示执行器不可达或内部异常，Worker会把任务记为 `error`。
/// 执行器自身判定的失败应通过 `status` 返回状态为 `Failed` 的任务记录来表达。
#[async_trait]
pub trait Executor: Send + Sync {
    /// 执行器名称
    fn name(&self) -> &str;

    /// 接收任务，返回执行器侧的任务ID
    ///
    /// 执行器拒绝该任务类型时返回错误。
    async fn submit(&self, task: Task) -> OrchestratorResult<String>;

    /// 查询任务当前状态，执行器不认识该ID时返回 `None`
    async fn status(&self, task_id: &str) -> OrchestratorResult<Option<Task>>;

    /// 取消任务，成功返回 `true`
    async fn cancel(&self, task_id: &str) -> OrchestratorResult<bool>;

    /// 检查是否支持指定的任务类型
    fn supports_task_type(&self, task_type: &str) -> bool;

    /// 获取支持的任务类型列表
    fn supported_task_types(&self) -> Vec<String> {
        vec![]
    }
}

/// 执行器注册表trait
#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    /// 注册执行器，同名执行器会被替换
    async fn register(&self, id: String, executor: Arc<dyn Executor>);

    /// 移除执行器
    async fn unregister(&self, id: &str) -> bool;

    /// 按ID查找执行器
    async fn get(&self, id: &str) -> Option<Arc<dyn Executor>>;

    /// 检查执行器是否存在
    async fn contains(&self, id: &str) -> bool;

    /// 检查执行器是否存在且支持该任务类型
    async fn supports(&self, id: &str, task_type: &str) -> bool {
        match self.get(id).await {
            Some(executor) => executor.supports_task_type(task_type),
            None => false,
        }
    }

    /// 获取所有执行器ID（有序）
    async fn list_executors(&self) -> Vec<String>;

    /// 获取所有执行器（按ID排序）
    async fn all(&self) -> Vec<(String, Arc<dyn Executor>)>;

    /// 获取执行器数量
    async fn count(&self) -> usize;
}
