use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务元数据键: 超时时间（秒）
pub const META_TIMEOUT: &str = "timeout";
/// 任务元数据键: 所属工作流ID
pub const META_WORKFLOW_ID: &str = "workflow_id";
/// 任务元数据键: 所属工作流步骤ID
pub const META_STEP_ID: &str = "step_id";
/// 任务元数据键: 执行器返回的任务ID
pub const META_EXECUTOR_TASK_ID: &str = "executor_task_id";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// 任务状态
///
/// 状态只能单向流转：
///
/// ```text
/// Pending → Running → Completed | Failed | Cancelled | Timeout | Error
/// ```
///
/// 五个终止状态互不相交，进入终止状态后不再变化。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "ERROR")]
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Timeout
                | TaskStatus::Error
        )
    }

    /// 计入错误率的终止状态
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务定义
///
/// 提交给单个执行器的最小工作单元。
///
/// # 字段说明
///
/// - `id`: 任务唯一标识，调用方传入或自动生成
/// - `executor_id`: 目标执行器ID
/// - `requester_id`: 提交者ID
/// - `task_type`: 执行器必须认识的任务类型
/// - `parameters`: 透传给执行器的参数
/// - `priority`: 优先级 1-10
/// - `progress`: 进度 0-100，仅供参考
/// - `result` / `error`: 终止时设置，二者互斥
/// - `metadata`: 自由格式元数据，用于关联工作流步骤和超时设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub executor_id: String,
    pub requester_id: String,
    pub task_type: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: u8,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// 创建新任务，ID自动生成
    pub fn new(executor_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            executor_id: executor_id.into(),
            requester_id: String::new(),
            task_type: task_type.into(),
            parameters: HashMap::new(),
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = requester_id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.metadata
            .insert(META_TIMEOUT.to_string(), serde_json::json!(seconds));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 状态流转，拒绝从终止状态回退
    ///
    /// 首次进入 Running 时记录 `started_at`，进入终止状态时记录 `completed_at`。
    pub fn transition(&mut self, status: TaskStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        if self.status == TaskStatus::Running && status == TaskStatus::Pending {
            return false;
        }
        self.status = status;
        if status == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            if status == TaskStatus::Completed {
                self.progress = 100.0;
            }
        }
        true
    }

    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = Some(result);
        self.error = None;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.result = None;
    }

    /// 元数据中的超时时间（秒）
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.metadata.get(META_TIMEOUT).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|s| *s > 0.0).map(|s| s.ceil() as u64))
        })
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.metadata.get(META_WORKFLOW_ID).and_then(|v| v.as_str())
    }

    pub fn step_id(&self) -> Option<&str> {
        self.metadata.get(META_STEP_ID).and_then(|v| v.as_str())
    }

    /// 执行器侧的任务ID，未记录时与任务ID相同
    pub fn executor_task_id(&self) -> &str {
        self.metadata
            .get(META_EXECUTOR_TASK_ID)
            .and_then(|v| v.as_str())
            .unwrap_or(&self.id)
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}
