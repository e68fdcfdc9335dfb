//! # 数据模型
//!
//! 编排引擎的核心数据结构：任务、工作流及其步骤，以及对外暴露的查询视图。
//!
//! ## 状态管理
//!
//! ### 任务状态流转
//! ```text
//! Pending → Running → Completed | Failed | Cancelled | Timeout | Error
//! ```
//!
//! ### 工作流状态流转
//! ```text
//! Created → Running → Completed | Failed | Error | Cancelled
//! ```
//!
//! ## 使用示例
//!
//! ```rust
//! use orchestrator_core::models::{Task, Workflow, WorkflowStep};
//! use serde_json::json;
//!
//! let task = Task::new("scraper", "fetch_page")
//!     .with_requester("user-1")
//!     .with_parameter("url", json!("https://example.com"))
//!     .with_timeout_seconds(30);
//!
//! let workflow = Workflow::new("daily-report")
//!     .with_step(WorkflowStep::new("fetch", "scraper", "fetch_page"))
//!     .with_step(WorkflowStep::new("summarize", "llm", "summarize").depends_on(["fetch"]));
//! assert_eq!(workflow.steps.len(), 2);
//! # let _ = task;
//! ```

pub mod task;
pub mod views;
pub mod workflow;

pub use task::*;
pub use views::*;
pub use workflow::*;
