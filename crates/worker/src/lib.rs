//! Worker池
//!
//! 固定数量的常驻Worker从调度器拉取任务，交给对应执行器，
//! 轮询执行器状态直到终止或超时，最后把结果写回调度器。

pub mod components;

pub use components::{ExecutionReport, TaskExecutionManager, WorkerPool, WorkerPoolBuilder};
