use std::sync::Arc;
use std::time::Duration;

use orchestrator::{EchoExecutor, OrchestrationEngine, ECHO_EXECUTOR_ID};
use orchestrator_core::{
    EngineConfig, EngineEvent, EngineState, OrchestratorError, Task, TaskStatus, WorkflowStatus,
    WorkflowView, META_EXECUTOR_TASK_ID,
};
use orchestrator_testing_utils::{
    diamond_workflow, linear_workflow, MockBehavior, MockExecutor, TestEnv, WorkflowBuilder,
};
use serde_json::json;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.worker_count = 4;
    config.worker.queue_poll_interval_ms = 10;
    config.worker.status_poll_interval_ms = 20;
    config
}

async fn engine_with(mock: MockExecutor) -> Arc<OrchestrationEngine> {
    Arc::new(
        OrchestrationEngine::builder()
            .config(fast_config())
            .executor("mock", mock.into_arc())
            .build()
            .await
            .unwrap(),
    )
}

async fn wait_workflow(engine: &Arc<OrchestrationEngine>, id: &str) -> WorkflowView {
    let done = TestEnv::wait_for(
        || {
            let engine = engine.clone();
            let id = id.to_string();
            async move {
                engine
                    .get_workflow_status(&id)
                    .await
                    .map(|view| view.status.is_terminal())
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(done, "工作流未在预期时间内结束");
    engine.get_workflow_status(id).await.unwrap()
}

async fn wait_task(engine: &Arc<OrchestrationEngine>, id: &str) -> Task {
    let done = TestEnv::wait_for(
        || {
            let engine = engine.clone();
            let id = id.to_string();
            async move {
                engine
                    .get_task_status(&id)
                    .await
                    .map(|task| task.is_terminal())
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(done, "任务未在预期时间内结束");
    engine.get_task_status(id).await.unwrap()
}

/// 收集事件直到指定工作流结束
async fn collect_until_finished(
    rx: &mut broadcast::Receiver<EngineEvent>,
    workflow_id: &str,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let collected = tokio::time::timeout(WAIT, async {
        while let Ok(event) = rx.recv().await {
            let finished = matches!(
                &event,
                EngineEvent::WorkflowFinished { workflow_id: id, .. } if id == workflow_id
            );
            events.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "未收到工作流结束事件");
    events
}

fn index_of(events: &[EngineEvent], kind: &str, task_id: &str) -> usize {
    events
        .iter()
        .position(|e| e.event_type() == kind && e.aggregate_id() == task_id)
        .unwrap_or_else(|| panic!("missing {kind} for {task_id}"))
}

#[tokio::test]
async fn test_two_step_workflow_end_to_end() {
    let engine = engine_with(MockExecutor::new("mock")).await;
    let mut rx = engine.subscribe_events();

    let workflow = WorkflowBuilder::new("two-steps")
        .step("s1", &[])
        .step("s2", &["s1"])
        .build();
    let id = engine.submit_workflow(workflow).await.unwrap();
    let events = collect_until_finished(&mut rx, &id).await;
    let view = wait_workflow(&engine, &id).await;

    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(view.progress, 100.0);
    assert!(view.steps.iter().all(|s| s.status == TaskStatus::Completed));

    let s1 = format!("{id}_s1");
    let s2 = format!("{id}_s2");
    assert!(index_of(&events, "TaskSubmitted", &s1) < index_of(&events, "TaskSubmitted", &s2));
    assert_eq!(events.first().unwrap().event_type(), "WorkflowSubmitted");

    let first = engine.get_task_status(&s1).await.unwrap();
    let second = engine.get_task_status(&s2).await.unwrap();
    assert!(first.completed_at.unwrap() <= second.started_at.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_linear_and_fan_out_ordering() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::CompleteAfter(
        Duration::from_millis(100),
        json!("ok"),
    ));
    let engine = engine_with(mock.clone()).await;

    let linear = engine.submit_workflow(linear_workflow()).await.unwrap();
    assert_eq!(
        wait_workflow(&engine, &linear).await.status,
        WorkflowStatus::Completed
    );
    let a = mock.submission_for(&format!("{linear}_a")).unwrap();
    let b = mock.submission_for(&format!("{linear}_b")).unwrap();
    let c = mock.submission_for(&format!("{linear}_c")).unwrap();
    assert!(b.submitted_at - a.submitted_at >= Duration::from_millis(100));
    assert!(c.submitted_at - b.submitted_at >= Duration::from_millis(100));

    let diamond = engine.submit_workflow(diamond_workflow()).await.unwrap();
    assert_eq!(
        wait_workflow(&engine, &diamond).await.status,
        WorkflowStatus::Completed
    );
    let b = mock.submission_for(&format!("{diamond}_b")).unwrap();
    let c = mock.submission_for(&format!("{diamond}_c")).unwrap();
    let gap = if b.submitted_at > c.submitted_at {
        b.submitted_at - c.submitted_at
    } else {
        c.submitted_at - b.submitted_at
    };
    assert!(gap < Duration::from_millis(100), "扇出步骤没有并发启动: {gap:?}");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_task_timeout_cancels_executor_once() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::NeverComplete)
        .with_remote_id_prefix("remote-");
    let engine = engine_with(mock.clone()).await;

    let id = engine
        .submit_task(Task::new("mock", "echo").with_id("slow").with_timeout_seconds(1))
        .await
        .unwrap();
    let task = wait_task(&engine, &id).await;

    assert_eq!(task.status, TaskStatus::Timeout);
    assert_eq!(mock.cancel_count("remote-slow"), 1);

    engine.shutdown().await;
    assert_eq!(mock.cancel_count("remote-slow"), 1);
}

#[tokio::test]
async fn test_submission_errors_are_synchronous() {
    let engine = engine_with(MockExecutor::new("mock")).await;

    let err = engine
        .submit_task(Task::new("ghost", "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownExecutor { .. }));

    let cyclic = WorkflowBuilder::new("cyclic")
        .with_id("cyclic")
        .step("a", &["c"])
        .step("b", &["a"])
        .step("c", &["b"])
        .build();
    let err = engine.submit_workflow(cyclic).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CyclicDependency { .. }));
    assert!(engine.get_workflow_status("cyclic").await.is_none());

    let status = engine.get_engine_status().await;
    assert_eq!(status.active_tasks, 0);
    assert_eq!(status.active_workflows, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_terminal_status_is_stable() {
    let engine = engine_with(
        MockExecutor::new("mock").with_default_behavior(MockBehavior::Succeed(json!({"n": 1}))),
    )
    .await;

    let id = engine.submit_task(Task::new("mock", "echo")).await.unwrap();
    let first = wait_task(&engine, &id).await;
    let second = engine.get_task_status(&id).await.unwrap();

    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.result, Some(json!({"n": 1})));
    assert_eq!(first, second);
    assert!(!engine.cancel_task(&id).await);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_workflow_forwards_to_executor() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::NeverComplete);
    let engine = engine_with(mock.clone()).await;

    let id = engine.submit_workflow(linear_workflow()).await.unwrap();
    let step_task = format!("{id}_a");
    let submitted = TestEnv::wait_for(
        || {
            let engine = engine.clone();
            let step_task = step_task.clone();
            async move {
                engine
                    .get_task_status(&step_task)
                    .await
                    .map(|task| task.metadata.contains_key(META_EXECUTOR_TASK_ID))
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(submitted);

    assert!(engine.cancel_workflow(&id).await);
    let view = wait_workflow(&engine, &id).await;
    assert_eq!(view.status, WorkflowStatus::Cancelled);
    assert!(view.steps.iter().all(|s| s.status == TaskStatus::Cancelled));

    let task = wait_task(&engine, &step_task).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(mock.cancel_count(&step_task), 1);
    assert!(!engine.cancel_workflow(&id).await);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_saturated_pool_steps_mirror_task_timeout() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::NeverComplete);
    let mut config = fast_config();
    config.worker.worker_count = 1;
    let engine = Arc::new(
        OrchestrationEngine::builder()
            .config(config)
            .executor("mock", mock.clone().into_arc())
            .build()
            .await
            .unwrap(),
    );

    let workflow = WorkflowBuilder::new("saturated")
        .step("a", &[])
        .with_timeout(1)
        .step("b", &[])
        .with_timeout(1)
        .build();
    let id = engine.submit_workflow(workflow).await.unwrap();
    let view = wait_workflow(&engine, &id).await;
    assert_eq!(view.status, WorkflowStatus::Failed);

    for step in &view.steps {
        let task_id = format!("{id}_{}", step.id);
        let task = wait_task(&engine, &task_id).await;
        assert_eq!(step.status, TaskStatus::Timeout, "step {}", step.id);
        assert_eq!(task.status, step.status, "task {task_id}");
        assert_eq!(mock.cancel_count(&task_id), 1);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_refused_cancel_keeps_step_in_sync_with_task() {
    let mock = MockExecutor::new("mock")
        .with_default_behavior(MockBehavior::NeverComplete)
        .with_cancel_refused();
    let engine = engine_with(mock.clone()).await;

    let workflow = WorkflowBuilder::new("stubborn")
        .step("a", &[])
        .with_timeout(1)
        .build();
    let id = engine.submit_workflow(workflow).await.unwrap();
    let step_task = format!("{id}_a");
    let submitted = TestEnv::wait_for(
        || {
            let engine = engine.clone();
            let step_task = step_task.clone();
            async move {
                engine
                    .get_task_status(&step_task)
                    .await
                    .map(|task| task.metadata.contains_key(META_EXECUTOR_TASK_ID))
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(submitted);

    assert!(engine.cancel_workflow(&id).await);
    let task = engine.get_task_status(&step_task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    let task = wait_task(&engine, &step_task).await;
    assert_eq!(task.status, TaskStatus::Timeout);
    let observer = engine.clone();
    let settled = TestEnv::wait_for(
        || {
            let engine = observer.clone();
            let id = id.clone();
            async move {
                engine
                    .get_workflow_status(&id)
                    .await
                    .map(|view| view.steps.iter().all(|s| s.status.is_terminal()))
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await;
    assert!(settled);

    let view = engine.get_workflow_status(&id).await.unwrap();
    assert_eq!(view.status, WorkflowStatus::Cancelled);
    assert_eq!(view.steps[0].status, task.status);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_status_and_metrics() {
    let mock = MockExecutor::new("mock")
        .with_behavior("echo", MockBehavior::Succeed(json!(null)))
        .with_behavior("flaky", MockBehavior::Fail("boom".into()));
    let engine = engine_with(mock).await;

    let submissions = (0..3)
        .map(|i| Task::new("mock", "echo").with_id(format!("ok-{i}")))
        .chain(std::iter::once(Task::new("mock", "flaky").with_id("bad")))
        .map(|task| engine.submit_task(task));
    let ids: Vec<String> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    for id in &ids {
        wait_task(&engine, id).await;
    }
    let recorded = TestEnv::wait_for(
        || {
            let engine = engine.clone();
            async move { engine.get_engine_status().await.metrics.total_processed == 4 }
        },
        WAIT,
    )
    .await;
    assert!(recorded);

    let status = engine.get_engine_status().await;
    assert_eq!(status.status, EngineState::Running);
    assert_eq!(status.metrics.total_processed, 4);
    assert_eq!(status.metrics.failed_count, 1);
    assert!((status.metrics.error_rate - 0.25).abs() < 1e-9);
    assert_eq!(status.metrics.tasks_by_status.get("COMPLETED"), Some(&3));
    assert!(status.metrics.executor_utilization.contains_key("mock"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_cancels_work() {
    let mock = MockExecutor::new("mock").with_default_behavior(MockBehavior::NeverComplete);
    let engine = engine_with(mock.clone()).await;

    let running = engine
        .submit_task(Task::new("mock", "echo").with_id("running"))
        .await
        .unwrap();
    let observer = mock.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let observer = observer.clone();
                async move { observer.submit_count() == 1 }
            },
            WAIT,
        )
        .await
    );
    let workflow = engine.submit_workflow(diamond_workflow()).await.unwrap();

    engine.shutdown().await;
    engine.shutdown().await;

    let status = engine.get_engine_status().await;
    assert_eq!(status.status, EngineState::Stopped);
    assert_eq!(
        engine.get_task_status(&running).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        engine.get_workflow_status(&workflow).await.unwrap().status,
        WorkflowStatus::Cancelled
    );
    assert!(matches!(
        engine.submit_task(Task::new("mock", "echo")).await,
        Err(OrchestratorError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_builtin_echo_executor() {
    let engine = OrchestrationEngine::builder()
        .config(fast_config())
        .executor(ECHO_EXECUTOR_ID, Arc::new(EchoExecutor::new()))
        .build()
        .await
        .unwrap();
    let engine = Arc::new(engine);

    let workflow = WorkflowBuilder::new("echo")
        .with_executor(ECHO_EXECUTOR_ID)
        .step("greet", &[])
        .with_parameter("message", json!("hello"))
        .typed_step("nap", "sleep", &["greet"])
        .with_parameter("duration_ms", json!(50))
        .build();
    let id = engine.submit_workflow(workflow).await.unwrap();
    let view = wait_workflow(&engine, &id).await;

    assert_eq!(view.status, WorkflowStatus::Completed);
    let greet = view.steps.iter().find(|s| s.id == "greet").unwrap();
    assert_eq!(greet.result, Some(json!({"message": "hello"})));

    engine.shutdown().await;
}
