//! 测试数据构造

use orchestrator_core::{Workflow, WorkflowStep};
use serde_json::Value;

/// 工作流构造器，步骤默认使用 `mock` 执行器和 `echo` 任务类型
pub struct WorkflowBuilder {
    workflow: Workflow,
    executor_id: String,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            workflow: Workflow::new(name),
            executor_id: "mock".to_string(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.workflow.id = id.to_string();
        self
    }

    pub fn with_executor(mut self, executor_id: &str) -> Self {
        self.executor_id = executor_id.to_string();
        self
    }

    pub fn step(self, id: &str, depends_on: &[&str]) -> Self {
        self.typed_step(id, "echo", depends_on)
    }

    pub fn typed_step(mut self, id: &str, task_type: &str, depends_on: &[&str]) -> Self {
        let step = WorkflowStep::new(id, self.executor_id.clone(), task_type)
            .depends_on(depends_on.iter().copied());
        self.workflow.steps.push(step);
        self
    }

    pub fn raw_step(mut self, step: WorkflowStep) -> Self {
        self.workflow.steps.push(step);
        self
    }

    /// 修改最后添加的步骤
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.timeout = seconds;
        }
        self
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        if let Some(step) = self.workflow.steps.last_mut() {
            step.parameters.insert(key.to_string(), value);
        }
        self
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}

/// a → b → c
pub fn linear_workflow() -> Workflow {
    WorkflowBuilder::new("linear")
        .step("a", &[])
        .step("b", &["a"])
        .step("c", &["b"])
        .build()
}

/// a → {b, c} → d
pub fn diamond_workflow() -> Workflow {
    WorkflowBuilder::new("diamond")
        .step("a", &[])
        .step("b", &["a"])
        .step("c", &["a"])
        .step("d", &["b", "c"])
        .build()
}
