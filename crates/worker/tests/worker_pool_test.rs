use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{
    DefaultExecutorRegistry, DispatcherConfig, EventBus, ExecutorRegistry, SystemClock, Task,
    TaskStatus, WorkerPoolConfig,
};
use orchestrator_dispatcher::TaskDispatcher;
use orchestrator_testing_utils::{MockBehavior, MockExecutor, TestEnv};
use orchestrator_worker::WorkerPool;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<DefaultExecutorRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    pool: WorkerPool,
}

async fn harness(mock: MockExecutor, worker_count: usize) -> Harness {
    let registry = Arc::new(DefaultExecutorRegistry::new());
    registry.register("mock".to_string(), mock.into_arc()).await;
    let dispatcher = Arc::new(TaskDispatcher::new(
        registry.clone(),
        Arc::new(EventBus::new()),
        Arc::new(SystemClock),
        DispatcherConfig::default(),
    ));
    let pool = WorkerPool::builder(dispatcher.clone())
        .worker_count(worker_count)
        .queue_poll_interval_ms(10)
        .status_poll_interval_ms(20)
        .build()
        .unwrap();
    Harness {
        registry,
        dispatcher,
        pool,
    }
}

async fn run_to_end(harness: &Harness, task: Task) -> Task {
    let id = harness.dispatcher.submit_task(task).await.unwrap();
    harness
        .dispatcher
        .wait_for_terminal(&id, WAIT)
        .await
        .expect("任务未在预期时间内结束")
}

#[tokio::test]
async fn test_successful_task() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::Succeed(json!("done")));
    let h = harness(mock.clone(), 2).await;
    h.pool.start().await.unwrap();

    let task = run_to_end(&h, Task::new("mock", "echo").with_id("t1")).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("done")));
    assert!(task.error.is_none());
    assert!(task.started_at.is_some() && task.completed_at.is_some());
    assert_eq!(mock.submitted_task_ids(), vec!["t1".to_string()]);

    h.pool.stop().await;
}

#[tokio::test]
async fn test_executor_reported_failure() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::Fail("bad input".into()));
    let h = harness(mock, 1).await;
    h.pool.start().await.unwrap();

    let task = run_to_end(&h, Task::new("mock", "echo")).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("bad input"));

    h.pool.stop().await;
}

#[tokio::test]
async fn test_timeout_cancels_exactly_once() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::NeverComplete)
        .with_remote_id_prefix("remote-");
    let h = harness(mock.clone(), 1).await;
    h.pool.start().await.unwrap();

    let task = run_to_end(&h, Task::new("mock", "echo").with_id("slow").with_timeout_seconds(1)).await;
    assert_eq!(task.status, TaskStatus::Timeout);
    assert!(task.error.unwrap().contains("超时"));
    assert_eq!(mock.cancel_count("remote-slow"), 1);
    assert_eq!(mock.cancel_calls().len(), 1);

    h.pool.stop().await;
    assert_eq!(mock.cancel_count("remote-slow"), 1);
}

#[tokio::test]
async fn test_hanging_status_call_still_times_out() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::StatusHangs);
    let h = harness(mock.clone(), 1).await;
    h.pool.start().await.unwrap();

    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo").with_id("stuck").with_timeout_seconds(1))
        .await
        .unwrap();
    let task = h
        .dispatcher
        .wait_for_terminal(&id, Duration::from_secs(3))
        .await
        .expect("执行器无响应时任务仍应按时超时");
    assert_eq!(task.status, TaskStatus::Timeout);
    assert_eq!(mock.cancel_count("stuck"), 1);

    h.pool.stop().await;
}

#[tokio::test]
async fn test_stop_interrupts_hanging_status_call() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::StatusHangs);
    let h = harness(mock.clone(), 1).await;
    h.pool.start().await.unwrap();

    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo").with_id("stuck").with_timeout_seconds(600))
        .await
        .unwrap();
    let observer = mock.clone();
    assert!(TestEnv::wait_for(|| {
        let observer = observer.clone();
        async move { observer.status_calls() >= 1 }
    }, WAIT)
    .await);

    let stopped = tokio::time::timeout(Duration::from_secs(3), h.pool.stop()).await;
    assert!(stopped.is_ok(), "执行器无响应时Worker池仍应能停止");

    let task = h.dispatcher.get_task_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(mock.cancel_count("stuck"), 1);
}

#[tokio::test]
async fn test_cancel_while_submitting_cancels_at_executor_once() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::NeverComplete)
        .with_submit_delay(Duration::from_millis(300));
    let h = harness(mock.clone(), 1).await;
    h.pool.start().await.unwrap();

    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo").with_id("in-submit"))
        .await
        .unwrap();
    let dispatcher = h.dispatcher.clone();
    assert!(TestEnv::wait_for(|| {
        let dispatcher = dispatcher.clone();
        async move {
            dispatcher
                .get_task("in-submit")
                .await
                .map(|task| task.status == TaskStatus::Running)
                .unwrap_or(false)
        }
    }, WAIT)
    .await);
    assert_eq!(mock.submit_count(), 0);

    assert!(h.dispatcher.cancel_task(&id).await);
    let observer = mock.clone();
    assert!(TestEnv::wait_for(|| {
        let observer = observer.clone();
        async move { observer.cancel_count("in-submit") == 1 }
    }, WAIT)
    .await);

    let task = h.dispatcher.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(mock.submit_count(), 1);
    assert_eq!(mock.cancel_calls().len(), 1);

    h.pool.stop().await;
}

#[tokio::test]
async fn test_status_error_becomes_error_and_worker_survives() {
    let mock = MockExecutor::new("mock")
        .with_behavior("echo", MockBehavior::Succeed(json!(1)))
        .with_behavior("broken", MockBehavior::StatusError("connection refused".into()));
    let h = harness(mock, 1).await;
    h.pool.start().await.unwrap();

    let broken = run_to_end(&h, Task::new("mock", "broken")).await;
    assert_eq!(broken.status, TaskStatus::Error);
    assert!(broken.error.unwrap().contains("connection refused"));

    let next = run_to_end(&h, Task::new("mock", "echo")).await;
    assert_eq!(next.status, TaskStatus::Completed);

    h.pool.stop().await;
}

#[tokio::test]
async fn test_submit_error_becomes_error() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::SubmitError("queue full".into()));
    let h = harness(mock, 1).await;
    h.pool.start().await.unwrap();

    let task = run_to_end(&h, Task::new("mock", "echo")).await;
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error.unwrap().contains("queue full"));

    h.pool.stop().await;
}

#[tokio::test]
async fn test_missing_executor_becomes_error() {
    let h = harness(MockExecutor::new("mock"), 1).await;
    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo"))
        .await
        .unwrap();
    assert!(h.registry.unregister("mock").await);
    h.pool.start().await.unwrap();

    let task = h.dispatcher.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error.unwrap().contains("mock"));

    h.pool.stop().await;
}

#[tokio::test]
async fn test_cancel_running_task() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::NeverComplete);
    let h = harness(mock.clone(), 1).await;
    h.pool.start().await.unwrap();

    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo").with_id("long"))
        .await
        .unwrap();
    let dispatcher = h.dispatcher.clone();
    let submitted = TestEnv::wait_for(
        || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .get_task("long")
                    .await
                    .map(|task| task.metadata.contains_key("executor_task_id"))
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(submitted);

    assert!(h.dispatcher.cancel_task(&id).await);
    let task = h.dispatcher.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(mock.cancel_count("long"), 1);

    h.pool.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_in_flight_task() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::NeverComplete);
    let h = harness(mock.clone(), 2).await;
    h.pool.start().await.unwrap();

    let id = h
        .dispatcher
        .submit_task(Task::new("mock", "echo").with_id("inflight"))
        .await
        .unwrap();
    let observer = mock.clone();
    assert!(TestEnv::wait_for(|| {
        let observer = observer.clone();
        async move { observer.submit_count() == 1 }
    }, WAIT)
    .await);

    h.pool.stop().await;
    assert!(!h.pool.is_running().await);

    let task = h.dispatcher.get_task_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(mock.cancel_count("inflight"), 1);
    assert_eq!(h.pool.busy_workers(), 0);
}

#[tokio::test]
async fn test_workers_run_tasks_concurrently() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::CompleteAfter(Duration::from_millis(200), json!(null)));
    let h = harness(mock.clone(), 2).await;
    h.pool.start().await.unwrap();

    let a = h.dispatcher.submit_task(Task::new("mock", "echo").with_id("a")).await.unwrap();
    let b = h.dispatcher.submit_task(Task::new("mock", "echo").with_id("b")).await.unwrap();
    let first = h.dispatcher.wait_for_terminal(&a, WAIT).await.unwrap();
    let second = h.dispatcher.wait_for_terminal(&b, WAIT).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(second.status, TaskStatus::Completed);

    let sub_a = mock.submission_for("a").unwrap();
    let sub_b = mock.submission_for("b").unwrap();
    let gap = if sub_a.submitted_at > sub_b.submitted_at {
        sub_a.submitted_at - sub_b.submitted_at
    } else {
        sub_b.submitted_at - sub_a.submitted_at
    };
    assert!(gap < Duration::from_millis(200), "两个任务没有并发执行: {gap:?}");

    h.pool.stop().await;
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = harness(MockExecutor::new("mock"), 1).await;
    h.pool.start().await.unwrap();
    assert!(h.pool.start().await.is_err());
    h.pool.stop().await;
    h.pool.stop().await;
}

#[test]
fn test_builder_rejects_zero_workers() {
    let dispatcher = Arc::new(TaskDispatcher::new(
        Arc::new(DefaultExecutorRegistry::new()),
        Arc::new(EventBus::new()),
        Arc::new(SystemClock),
        DispatcherConfig::default(),
    ));
    assert!(WorkerPool::builder(dispatcher)
        .config(WorkerPoolConfig {
            worker_count: 0,
            ..WorkerPoolConfig::default()
        })
        .build()
        .is_err());
}
