//! # Orchestrator Testing Utils
//!
//! 各 crate 共用的测试工具：
//!
//! - **MockExecutor**: 行为可配置的内存执行器，记录提交和取消调用
//! - **ManualClock**: 手动推进的时钟
//! - **WorkflowBuilder**: 工作流测试数据构造
//! - **TestEnv**: 异步条件等待等辅助函数
//!
//! ```toml
//! [dev-dependencies]
//! orchestrator-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
