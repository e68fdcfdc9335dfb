//! 生命周期事件
//!
//! Worker池、调度器和工作流引擎通过 [`EventBus`] 发布事件，
//! 指标统计、日志等关注方以监听器或广播订阅的方式消费，互不感知。

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{TaskStatus, WorkflowStatus};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 引擎生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EngineEvent {
    TaskSubmitted {
        task_id: String,
        executor_id: String,
        task_type: String,
        occurred_at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: String,
        executor_id: String,
        occurred_at: DateTime<Utc>,
    },
    TaskFinished {
        task_id: String,
        executor_id: String,
        status: TaskStatus,
        duration_ms: u64,
        error: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    WorkflowSubmitted {
        workflow_id: String,
        step_count: usize,
        occurred_at: DateTime<Utc>,
    },
    WorkflowFinished {
        workflow_id: String,
        status: WorkflowStatus,
        occurred_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::TaskSubmitted { .. } => "TaskSubmitted",
            EngineEvent::TaskStarted { .. } => "TaskStarted",
            EngineEvent::TaskFinished { .. } => "TaskFinished",
            EngineEvent::WorkflowSubmitted { .. } => "WorkflowSubmitted",
            EngineEvent::WorkflowFinished { .. } => "WorkflowFinished",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::TaskSubmitted { occurred_at, .. } => *occurred_at,
            EngineEvent::TaskStarted { occurred_at, .. } => *occurred_at,
            EngineEvent::TaskFinished { occurred_at, .. } => *occurred_at,
            EngineEvent::WorkflowSubmitted { occurred_at, .. } => *occurred_at,
            EngineEvent::WorkflowFinished { occurred_at, .. } => *occurred_at,
        }
    }

    /// 事件所属的聚合ID（任务ID或工作流ID）
    pub fn aggregate_id(&self) -> &str {
        match self {
            EngineEvent::TaskSubmitted { task_id, .. } => task_id,
            EngineEvent::TaskStarted { task_id, .. } => task_id,
            EngineEvent::TaskFinished { task_id, .. } => task_id,
            EngineEvent::WorkflowSubmitted { workflow_id, .. } => workflow_id,
            EngineEvent::WorkflowFinished { workflow_id, .. } => workflow_id,
        }
    }
}

/// 同步事件监听器
///
/// 在发布者线程内被调用，实现中不能阻塞。
pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// 事件总线
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EngineEventListener>>>,
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineEventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// 订阅广播事件，慢消费者可能收到 `Lagged`
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!(event_type = event.event_type(), id = event.aggregate_id(), "发布事件");
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener.on_event(&event);
            }
        }
        // 没有订阅者时发送失败，忽略
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
