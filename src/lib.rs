//! 任务与工作流编排引擎
//!
//! 对外入口是 [`OrchestrationEngine`]：通过 [`EngineBuilder`] 注入执行器和配置后启动，
//! 之后提交任务或工作流、按ID轮询状态、取消，并在退出前调用 `shutdown`。

pub mod echo_executor;
pub mod engine;
pub mod shutdown;

pub use echo_executor::{EchoExecutor, ECHO_EXECUTOR_ID};
pub use engine::{EngineBuilder, OrchestrationEngine};
pub use shutdown::ShutdownManager;
