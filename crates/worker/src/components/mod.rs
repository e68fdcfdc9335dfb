pub mod task_execution;
pub mod worker_pool;

pub use task_execution::{ExecutionReport, TaskExecutionManager};
pub use worker_pool::{WorkerPool, WorkerPoolBuilder};
