use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// 工作流状态
///
/// ```text
/// Created → Running → Completed | Failed | Error | Cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Error
                | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Error => "ERROR",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工作流步骤，DAG中的一个节点
///
/// `executor_id`、`task_type`、`parameters` 与 [`Task`](super::Task) 含义相同；
/// `depends_on` 中的步骤全部进入终止状态后本步骤才会启动。
/// `status`、`result`、`error` 在底层任务创建后与其保持一致。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub executor_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 超时时间（秒），0 表示使用引擎默认值
    #[serde(default)]
    pub timeout: u64,
    /// 仅做记录，驱动循环不会自动重试失败的步骤
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_step_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_step_status() -> TaskStatus {
    TaskStatus::Pending
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        executor_id: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            executor_id: executor_id.into(),
            task_type: task_type.into(),
            parameters: HashMap::new(),
            depends_on: Vec::new(),
            timeout: 0,
            max_retries: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            task_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 工作流定义
///
/// 步骤有序集合加上工作流自身的生命周期信息。`progress` 为已终止步骤占比 × 100。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    #[serde(default = "new_workflow_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requester_id: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_workflow_status")]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn new_workflow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_workflow_status() -> WorkflowStatus {
    WorkflowStatus::Created
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_workflow_id(),
            name: name.into(),
            description: String::new(),
            requester_id: String::new(),
            steps: Vec::new(),
            status: WorkflowStatus::Created,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = requester_id.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn terminal_step_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_terminal()).count()
    }

    /// 按已终止步骤数重新计算进度
    pub fn recompute_progress(&mut self) {
        if self.steps.is_empty() {
            self.progress = 0.0;
            return;
        }
        self.progress = self.terminal_step_count() as f64 / self.steps.len() as f64 * 100.0;
    }

    /// 由步骤终止状态汇总工作流终止状态
    ///
    /// 任一步骤为 failed/timeout/error 时为 `Failed`，否则为 `Completed`。
    pub fn aggregate_status(&self) -> WorkflowStatus {
        if self.steps.iter().any(|s| s.status.is_failure()) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        }
    }
}
