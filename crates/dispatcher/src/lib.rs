//! 任务调度与工作流驱动
//!
//! - [`TaskDispatcher`]: 任务提交校验、排队、状态查询与取消
//! - [`DependencyChecker`]: 工作流DAG校验与环检测
//! - [`WorkflowEngine`]: 按就绪集合分批驱动工作流

pub mod dependency_checker;
pub mod dispatcher;
pub mod task_queue;
pub mod workflow_engine;

pub use dependency_checker::{has_cycle, plan_next_batch, BatchPlan, DependencyChecker};
pub use dispatcher::TaskDispatcher;
pub use task_queue::TaskQueue;
pub use workflow_engine::WorkflowEngine;
