//! 测试用的执行器与时钟

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{
    Clock, Executor, OrchestratorError, OrchestratorResult, Task, TaskStatus,
};
use serde_json::Value;

/// 模拟执行器对某一类任务的表现
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// 首次查询即完成
    Succeed(Value),
    /// 提交后经过指定时间才完成
    CompleteAfter(Duration, Value),
    /// 首次查询即失败
    Fail(String),
    /// 一直处于运行中，直到被取消
    NeverComplete,
    /// 查询状态时返回错误
    StatusError(String),
    /// 提交时返回错误
    SubmitError(String),
    /// 查询状态的调用永不返回
    StatusHangs,
}

#[derive(Debug, Clone)]
struct RemoteRecord {
    task: Task,
    behavior: MockBehavior,
    submitted_at: Instant,
    cancelled: bool,
}

/// 一次提交调用的记录
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: String,
    pub remote_id: String,
    pub task_type: String,
    pub submitted_at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    records: HashMap<String, RemoteRecord>,
    submissions: Vec<Submission>,
    cancel_calls: Vec<String>,
    status_calls: usize,
}

/// 内存中的可配置执行器
#[derive(Clone)]
pub struct MockExecutor {
    name: String,
    task_types: HashSet<String>,
    behaviors: HashMap<String, MockBehavior>,
    default_behavior: MockBehavior,
    remote_id_prefix: String,
    submit_delay: Option<Duration>,
    refuse_cancel: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    /// 默认只支持 `echo` 任务，立即成功并返回参数
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            task_types: HashSet::from(["echo".to_string()]),
            behaviors: HashMap::new(),
            default_behavior: MockBehavior::Succeed(Value::Null),
            remote_id_prefix: String::new(),
            submit_delay: None,
            refuse_cancel: false,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_task_types(mut self, task_types: &[&str]) -> Self {
        self.task_types = task_types.iter().map(|t| t.to_string()).collect();
        self
    }

    /// 为某个任务类型指定行为，同时将其加入支持列表
    pub fn with_behavior(mut self, task_type: &str, behavior: MockBehavior) -> Self {
        self.task_types.insert(task_type.to_string());
        self.behaviors.insert(task_type.to_string(), behavior);
        self
    }

    pub fn with_default_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// 执行器侧任务ID前缀，非空时返回的ID与引擎任务ID不同
    pub fn with_remote_id_prefix(mut self, prefix: &str) -> Self {
        self.remote_id_prefix = prefix.to_string();
        self
    }

    /// 提交调用在返回前等待指定时间
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// 所有取消请求都返回 `false`，任务继续按原行为执行
    pub fn with_cancel_refused(mut self) -> Self {
        self.refuse_cancel = true;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Executor> {
        Arc::new(self)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submitted_task_ids(&self) -> Vec<String> {
        self.submissions().into_iter().map(|s| s.task_id).collect()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    pub fn submission_for(&self, task_id: &str) -> Option<Submission> {
        self.submissions()
            .into_iter()
            .find(|s| s.task_id == task_id)
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn cancel_count(&self, remote_id: &str) -> usize {
        self.cancel_calls()
            .iter()
            .filter(|id| id.as_str() == remote_id)
            .count()
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    fn behavior_for(&self, task_type: &str) -> MockBehavior {
        self.behaviors
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, task: Task) -> OrchestratorResult<String> {
        if !self.supports_task_type(&task.task_type) {
            return Err(OrchestratorError::UnsupportedTaskType {
                executor_id: self.name.clone(),
                task_type: task.task_type.clone(),
            });
        }
        let behavior = self.behavior_for(&task.task_type);
        if let MockBehavior::SubmitError(message) = &behavior {
            return Err(OrchestratorError::ExecutorFailure(message.clone()));
        }

        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }

        let remote_id = format!("{}{}", self.remote_id_prefix, task.id);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.submissions.push(Submission {
            task_id: task.id.clone(),
            remote_id: remote_id.clone(),
            task_type: task.task_type.clone(),
            submitted_at: now,
        });
        let mut remote = task;
        remote.transition(TaskStatus::Running, Utc::now());
        state.records.insert(
            remote_id.clone(),
            RemoteRecord {
                task: remote,
                behavior,
                submitted_at: now,
                cancelled: false,
            },
        );
        Ok(remote_id)
    }

    async fn status(&self, task_id: &str) -> OrchestratorResult<Option<Task>> {
        let hangs = {
            let mut state = self.state.lock().unwrap();
            state.status_calls += 1;
            state
                .records
                .get(task_id)
                .map(|record| matches!(record.behavior, MockBehavior::StatusHangs))
                .unwrap_or(false)
        };
        if hangs {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let Some(record) = state.records.get_mut(task_id) else {
            return Ok(None);
        };
        if record.cancelled {
            record.task.transition(TaskStatus::Cancelled, Utc::now());
            return Ok(Some(record.task.clone()));
        }

        match record.behavior.clone() {
            MockBehavior::Succeed(result) => {
                if record.task.transition(TaskStatus::Completed, Utc::now()) {
                    record.task.set_result(result);
                }
            }
            MockBehavior::CompleteAfter(delay, result) => {
                if record.submitted_at.elapsed() >= delay
                    && record.task.transition(TaskStatus::Completed, Utc::now())
                {
                    record.task.set_result(result);
                }
            }
            MockBehavior::Fail(message) => {
                if record.task.transition(TaskStatus::Failed, Utc::now()) {
                    record.task.set_error(message);
                }
            }
            MockBehavior::NeverComplete | MockBehavior::StatusHangs => {}
            MockBehavior::StatusError(message) => {
                return Err(OrchestratorError::ExecutorFailure(message));
            }
            MockBehavior::SubmitError(_) => return Ok(None),
        }
        Ok(Some(record.task.clone()))
    }

    async fn cancel(&self, task_id: &str) -> OrchestratorResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls.push(task_id.to_string());
        if self.refuse_cancel {
            return Ok(false);
        }
        match state.records.get_mut(task_id) {
            Some(record) if !record.task.is_terminal() && !record.cancelled => {
                record.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn supports_task_type(&self, task_type: &str) -> bool {
        self.task_types.contains(task_type)
    }

    fn supported_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.task_types.iter().cloned().collect();
        types.sort();
        types
    }
}

/// 手动推进的时钟
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.now.lock().unwrap() = value;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
