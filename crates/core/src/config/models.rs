use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// 队列为空时的等待间隔（毫秒）
    pub queue_poll_interval_ms: u64,
    /// 轮询执行器状态的间隔（毫秒）
    pub status_poll_interval_ms: u64,
    /// 任务元数据未指定超时时的默认值（秒）
    pub default_task_timeout_seconds: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_poll_interval_ms: 100,
            status_poll_interval_ms: 1000,
            default_task_timeout_seconds: 300,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow::anyhow!("Worker数量必须大于0"));
        }
        if self.queue_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("队列轮询间隔必须大于0"));
        }
        if self.status_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("状态轮询间隔必须大于0"));
        }
        if self.default_task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认任务超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 已终止任务快照的最大保留条数
    pub max_finished_tasks: usize,
    /// 已终止任务快照的保留时间（秒）
    pub finished_retention_seconds: u64,
    /// 按优先级出队，关闭时严格先进先出
    pub priority_ordering: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_finished_tasks: 1000,
            finished_retention_seconds: 300,
            priority_ordering: false,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_finished_tasks == 0 {
            return Err(anyhow::anyhow!("已完成任务保留条数必须大于0"));
        }
        if self.finished_retention_seconds == 0 {
            return Err(anyhow::anyhow!("已完成任务保留时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 步骤未指定超时时的默认值（秒）
    pub default_step_timeout_seconds: u64,
    /// 等待步骤任务时在步骤超时之外额外等待的时间（毫秒）
    pub step_wait_grace_ms: u64,
    /// 已结束工作流最多保留的数量
    pub max_finished_workflows: usize,
    /// 已结束工作流的保留时间（秒）
    pub finished_retention_seconds: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_seconds: 300,
            step_wait_grace_ms: 500,
            max_finished_workflows: 1000,
            finished_retention_seconds: 300,
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_step_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认步骤超时时间必须大于0"));
        }
        if self.max_finished_workflows == 0 {
            return Err(anyhow::anyhow!("已结束工作流保留数量必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "json" 或 "pretty"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志格式: {}，支持的格式: {:?}",
                self.log_format,
                valid_formats
            ));
        }
        Ok(())
    }
}
