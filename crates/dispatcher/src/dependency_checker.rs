use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use orchestrator_core::{
    ExecutorRegistry, OrchestratorError, OrchestratorResult, TaskStatus, Workflow,
};

/// 下一轮驱动的计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPlan {
    /// 可以并发启动的步骤
    Ready(Vec<String>),
    /// 所有步骤都已终止
    Finished,
    /// 没有可启动的步骤但仍有步骤未终止
    Stuck(Vec<String>),
}

/// 工作流依赖校验
///
/// 只在提交时运行一次，执行过程中不会再次检查执行器是否可用。
pub struct DependencyChecker {
    registry: Arc<dyn ExecutorRegistry>,
}

impl DependencyChecker {
    pub fn new(registry: Arc<dyn ExecutorRegistry>) -> Self {
        Self { registry }
    }

    pub async fn validate(&self, workflow: &Workflow) -> OrchestratorResult<()> {
        validate_structure(workflow)?;

        for step in &workflow.steps {
            if !self
                .registry
                .supports(&step.executor_id, &step.task_type)
                .await
            {
                return Err(OrchestratorError::UnsupportedStep {
                    step_id: step.id.clone(),
                    executor_id: step.executor_id.clone(),
                    task_type: step.task_type.clone(),
                });
            }
        }

        if has_cycle(workflow) {
            return Err(OrchestratorError::CyclicDependency {
                workflow_id: workflow.id.clone(),
            });
        }

        debug!(workflow_id = %workflow.id, steps = workflow.steps.len(), "工作流校验通过");
        Ok(())
    }
}

fn validate_structure(workflow: &Workflow) -> OrchestratorResult<()> {
    if workflow.id.trim().is_empty() {
        return Err(OrchestratorError::InvalidWorkflow(
            "工作流ID不能为空".to_string(),
        ));
    }
    if workflow.steps.is_empty() {
        return Err(OrchestratorError::InvalidWorkflow(format!(
            "工作流 {} 没有任何步骤",
            workflow.id
        )));
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(
                "步骤ID不能为空".to_string(),
            ));
        }
        if step.executor_id.trim().is_empty() || step.task_type.trim().is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "步骤 {} 缺少执行器ID或任务类型",
                step.id
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "步骤ID重复: {}",
                step.id
            )));
        }
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "步骤 {} 不能依赖自身",
                    step.id
                )));
            }
            if !seen.contains(dep.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "步骤 {} 依赖不存在的步骤: {}",
                    step.id, dep
                )));
            }
        }
    }
    Ok(())
}

/// 深度优先遍历检测环，遇到第一条回边即返回 `true`
pub fn has_cycle(workflow: &Workflow) -> bool {
    let graph: HashMap<&str, Vec<&str>> = workflow
        .steps
        .iter()
        .map(|step| {
            (
                step.id.as_str(),
                step.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if on_stack.contains(node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        on_stack.insert(node);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if visit(*dep, graph, visited, on_stack) {
                    return true;
                }
            }
        }
        on_stack.remove(node);
        false
    }

    workflow
        .steps
        .iter()
        .any(|step| visit(step.id.as_str(), &graph, &mut visited, &mut on_stack))
}

/// 计算下一批可启动的步骤
///
/// 已完成集合包含所有已终止的步骤，依赖失败不会阻止下游步骤启动。
pub fn plan_next_batch(workflow: &Workflow) -> BatchPlan {
    let completed: HashSet<&str> = workflow
        .steps
        .iter()
        .filter(|step| step.is_terminal())
        .map(|step| step.id.as_str())
        .collect();

    if completed.len() == workflow.steps.len() {
        return BatchPlan::Finished;
    }

    let ready: Vec<String> = workflow
        .steps
        .iter()
        .filter(|step| step.status == TaskStatus::Pending)
        .filter(|step| {
            step.depends_on
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
        })
        .map(|step| step.id.clone())
        .collect();

    if ready.is_empty() {
        let blocked = workflow
            .steps
            .iter()
            .filter(|step| !step.is_terminal())
            .map(|step| step.id.clone())
            .collect();
        return BatchPlan::Stuck(blocked);
    }
    BatchPlan::Ready(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::WorkflowStep;

    fn workflow(steps: &[(&str, &[&str])]) -> Workflow {
        let mut wf = Workflow::new("wf").with_id("wf");
        for (id, deps) in steps {
            wf.steps
                .push(WorkflowStep::new(*id, "exec", "echo").depends_on(deps.iter().copied()));
        }
        wf
    }

    #[test]
    fn test_two_step_cycle() {
        let wf = workflow(&[("a", &["b"]), ("b", &["a"])]);
        assert!(has_cycle(&wf));
    }

    #[test]
    fn test_long_cycle_behind_acyclic_prefix() {
        let wf = workflow(&[
            ("root", &[]),
            ("x", &["root", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
        ]);
        assert!(has_cycle(&wf));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let wf = workflow(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert!(!has_cycle(&wf));
    }

    #[test]
    fn test_structure_errors() {
        let empty = Workflow::new("wf");
        assert!(matches!(
            validate_structure(&empty),
            Err(OrchestratorError::InvalidWorkflow(_))
        ));

        let dup = workflow(&[("a", &[]), ("a", &[])]);
        assert!(matches!(
            validate_structure(&dup),
            Err(OrchestratorError::InvalidWorkflow(_))
        ));

        let unknown = workflow(&[("a", &["ghost"])]);
        assert!(matches!(
            validate_structure(&unknown),
            Err(OrchestratorError::InvalidWorkflow(_))
        ));

        let self_dep = workflow(&[("a", &["a"])]);
        assert!(matches!(
            validate_structure(&self_dep),
            Err(OrchestratorError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_plan_counts_failed_dependency_as_completed() {
        let mut wf = workflow(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        assert_eq!(plan_next_batch(&wf), BatchPlan::Ready(vec!["a".to_string()]));

        wf.steps[0].status = TaskStatus::Failed;
        assert_eq!(
            plan_next_batch(&wf),
            BatchPlan::Ready(vec!["b".to_string(), "c".to_string()])
        );

        wf.steps[1].status = TaskStatus::Completed;
        wf.steps[2].status = TaskStatus::Timeout;
        assert_eq!(plan_next_batch(&wf), BatchPlan::Finished);
    }

    #[test]
    fn test_plan_reports_stuck_steps() {
        let mut wf = workflow(&[("a", &[]), ("b", &["a"])]);
        wf.steps[0].status = TaskStatus::Running;
        assert_eq!(
            plan_next_batch(&wf),
            BatchPlan::Stuck(vec!["a".to_string(), "b".to_string()])
        );
    }
}
