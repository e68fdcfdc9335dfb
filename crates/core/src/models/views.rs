use chrono::{DateTime, Utc};
use serde::Serialize;

use super::task::{Task, TaskStatus};
use super::workflow::{Workflow, WorkflowStatus};
use crate::status_aggregator::EngineMetrics;

/// 任务查询视图，即任务记录的完整快照
pub type TaskView = Task;

/// 工作流中单个步骤的摘要
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepSummary {
    pub id: String,
    pub executor_id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// 工作流查询视图
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub requester_id: String,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSummary>,
}

impl From<&Workflow> for WorkflowView {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            requester_id: workflow.requester_id.clone(),
            status: workflow.status,
            progress: workflow.progress,
            error: workflow.error.clone(),
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
            steps: workflow
                .steps
                .iter()
                .map(|step| StepSummary {
                    id: step.id.clone(),
                    executor_id: step.executor_id.clone(),
                    status: step.status,
                    result: step.result.clone(),
                    error: step.error.clone(),
                })
                .collect(),
        }
    }
}

/// 引擎运行状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    ShuttingDown,
    Stopped,
}

/// 引擎整体状态视图
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatusView {
    pub status: EngineState,
    pub active_tasks: usize,
    pub active_workflows: usize,
    pub queue_depth: usize,
    pub metrics: EngineMetrics,
}
