use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_core::{Executor, OrchestratorError, OrchestratorResult, Task, TaskStatus};

pub const ECHO_EXECUTOR_ID: &str = "echo";

/// 进程内执行器，用于本地演示与冒烟测试
///
/// - `echo`: 立即完成，结果为任务参数
/// - `sleep`: 按 `duration_ms` 参数等待后完成，期间按时间比例报告进度
/// - `fail`: 以 `message` 参数作为错误信息失败
pub struct EchoExecutor {
    tasks: Arc<RwLock<HashMap<String, EchoRecord>>>,
}

struct EchoRecord {
    task: Task,
    accepted_at: Instant,
    duration: Duration,
}

impl EchoExecutor {
    pub const TASK_TYPES: [&'static str; 3] = ["echo", "sleep", "fail"];

    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sleep_duration(task: &Task) -> Duration {
        let millis = task
            .parameters
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1000);
        Duration::from_millis(millis)
    }

    fn advance(record: &mut EchoRecord) {
        if record.task.is_terminal() {
            return;
        }
        let now = Utc::now();
        match record.task.task_type.as_str() {
            "echo" => {
                let result = json!(record.task.parameters);
                if record.task.transition(TaskStatus::Completed, now) {
                    record.task.set_result(result);
                }
            }
            "sleep" => {
                let elapsed = record.accepted_at.elapsed();
                if elapsed >= record.duration {
                    let slept = record.duration.as_millis() as u64;
                    if record.task.transition(TaskStatus::Completed, now) {
                        record.task.set_result(json!({ "slept_ms": slept }));
                    }
                } else {
                    let ratio = elapsed.as_secs_f64() / record.duration.as_secs_f64();
                    record.task.progress = (ratio * 100.0).clamp(0.0, 99.0);
                }
            }
            _ => {
                let message = record
                    .task
                    .parameters
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("任务按要求失败")
                    .to_string();
                if record.task.transition(TaskStatus::Failed, now) {
                    record.task.set_error(message);
                }
            }
        }
    }
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        ECHO_EXECUTOR_ID
    }

    async fn submit(&self, task: Task) -> OrchestratorResult<String> {
        if !self.supports_task_type(&task.task_type) {
            return Err(OrchestratorError::UnsupportedTaskType {
                executor_id: ECHO_EXECUTOR_ID.to_string(),
                task_type: task.task_type.clone(),
            });
        }

        let id = task.id.clone();
        let duration = Self::sleep_duration(&task);
        let mut local = task;
        local.transition(TaskStatus::Running, Utc::now());
        debug!(task_id = %id, task_type = %local.task_type, "echo执行器接收任务");

        self.tasks.write().await.insert(
            id.clone(),
            EchoRecord {
                task: local,
                accepted_at: Instant::now(),
                duration,
            },
        );
        Ok(id)
    }

    async fn status(&self, task_id: &str) -> OrchestratorResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        Ok(tasks.get_mut(task_id).map(|record| {
            Self::advance(record);
            record.task.clone()
        }))
    }

    async fn cancel(&self, task_id: &str) -> OrchestratorResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(record) => Ok(record.task.transition(TaskStatus::Cancelled, Utc::now())),
            None => Ok(false),
        }
    }

    fn supports_task_type(&self, task_type: &str) -> bool {
        Self::TASK_TYPES.contains(&task_type)
    }

    fn supported_task_types(&self) -> Vec<String> {
        Self::TASK_TYPES.iter().map(|t| t.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        let executor = EchoExecutor::new();
        let task = Task::new(ECHO_EXECUTOR_ID, "echo")
            .with_id("e1")
            .with_parameter("message", json!("hi"));
        let id = executor.submit(task).await.unwrap();

        let status = executor.status(&id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskStatus::Completed);
        assert_eq!(status.result, Some(json!({"message": "hi"})));
        assert_eq!(status.progress, 100.0);
    }

    #[tokio::test]
    async fn test_sleep_can_be_cancelled() {
        let executor = EchoExecutor::new();
        let task = Task::new(ECHO_EXECUTOR_ID, "sleep")
            .with_id("s1")
            .with_parameter("duration_ms", json!(60_000));
        let id = executor.submit(task).await.unwrap();

        let running = executor.status(&id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.progress < 100.0);

        assert!(executor.cancel(&id).await.unwrap());
        assert!(!executor.cancel(&id).await.unwrap());
        let cancelled = executor.status(&id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_and_unknown() {
        let executor = EchoExecutor::new();
        let id = executor
            .submit(Task::new(ECHO_EXECUTOR_ID, "fail").with_parameter("message", json!("nope")))
            .await
            .unwrap();
        let failed = executor.status(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("nope"));

        assert!(executor.status("missing").await.unwrap().is_none());
        assert!(executor
            .submit(Task::new(ECHO_EXECUTOR_ID, "translate"))
            .await
            .is_err());
    }
}
