use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;

use crate::clock::Clock;
use crate::events::{EngineEvent, EngineEventListener};
use crate::models::TaskStatus;

/// 引擎指标快照
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineMetrics {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub total_processed: u64,
    pub failed_count: u64,
    pub error_rate: f64,
    pub average_duration_ms: f64,
    pub tasks_by_status: BTreeMap<String, u64>,
    /// 执行器利用率（百分比，0-100）
    pub executor_utilization: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct AggregateState {
    total_processed: u64,
    failed_count: u64,
    average_duration_ms: f64,
    by_status: HashMap<TaskStatus, u64>,
    busy_time: HashMap<String, Duration>,
}

/// 任务指标汇总
///
/// 作为事件监听器挂到 [`EventBus`](crate::events::EventBus) 上，
/// 每个终止任务更新一次；同时把计数写入 `metrics` 门面。
pub struct MetricsAggregator {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    state: Mutex<AggregateState>,
}

impl MetricsAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            state: Mutex::new(AggregateState::default()),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        (self.clock.now() - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// 记录一个终止任务
    pub fn record_task(&self, executor_id: &str, status: TaskStatus, duration: Duration) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        state.total_processed += 1;
        let n = state.total_processed as f64;
        state.average_duration_ms = (state.average_duration_ms * (n - 1.0) + duration_ms) / n;
        if status.is_failure() {
            state.failed_count += 1;
        }
        *state.by_status.entry(status).or_insert(0) += 1;
        *state
            .busy_time
            .entry(executor_id.to_string())
            .or_insert(Duration::ZERO) += duration;

        counter!("orchestrator_tasks_processed_total", "status" => status.as_str()).increment(1);
        histogram!("orchestrator_task_duration_ms", "executor" => executor_id.to_string())
            .record(duration_ms);
        gauge!("orchestrator_task_error_rate")
            .set(state.failed_count as f64 / state.total_processed as f64);
    }

    pub fn snapshot(&self) -> EngineMetrics {
        let uptime = self.uptime();
        let uptime_secs = uptime.as_secs_f64();
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let error_rate = if state.total_processed == 0 {
            0.0
        } else {
            state.failed_count as f64 / state.total_processed as f64
        };

        let executor_utilization = state
            .busy_time
            .iter()
            .map(|(id, busy)| {
                let utilization = if uptime_secs > 0.0 {
                    (busy.as_secs_f64() / uptime_secs * 100.0).min(100.0)
                } else {
                    0.0
                };
                (id.clone(), utilization)
            })
            .collect();

        EngineMetrics {
            started_at: self.started_at,
            uptime_seconds: uptime_secs,
            total_processed: state.total_processed,
            failed_count: state.failed_count,
            error_rate,
            average_duration_ms: state.average_duration_ms,
            tasks_by_status: state
                .by_status
                .iter()
                .map(|(status, count)| (status.as_str().to_string(), *count))
                .collect(),
            executor_utilization,
        }
    }
}

impl EngineEventListener for MetricsAggregator {
    fn on_event(&self, event: &EngineEvent) {
        if let EngineEvent::TaskFinished {
            executor_id,
            status,
            duration_ms,
            ..
        } = event
        {
            self.record_task(executor_id, *status, Duration::from_millis(*duration_ms));
        }
    }
}
