use thiserror::Error;

/// 编排引擎错误类型定义
///
/// 只用于提交阶段的同步校验和引擎内部调用失败；任务运行期的
/// 超时、失败、取消等结果记录在任务状态上，不会以错误形式抛出。
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("无效的任务: {0}")]
    InvalidTask(String),

    #[error("无效的工作流: {0}")]
    InvalidWorkflow(String),

    #[error("未注册的执行器: {executor_id}")]
    UnknownExecutor { executor_id: String },

    #[error("执行器 {executor_id} 不支持任务类型: {task_type}")]
    UnsupportedTaskType {
        executor_id: String,
        task_type: String,
    },

    #[error("步骤 {step_id} 不受支持: 执行器={executor_id}, 任务类型={task_type}")]
    UnsupportedStep {
        step_id: String,
        executor_id: String,
        task_type: String,
    },

    #[error("工作流 {workflow_id} 检测到循环依赖")]
    CyclicDependency { workflow_id: String },

    #[error("执行器未找到: {executor_id}")]
    ExecutorNotFound { executor_id: String },

    #[error("执行器调用失败: {0}")]
    ExecutorFailure(String),

    #[error("引擎正在关闭，拒绝新的工作")]
    ShuttingDown,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// 是否属于提交阶段的校验错误
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidTask(_)
                | OrchestratorError::InvalidWorkflow(_)
                | OrchestratorError::UnknownExecutor { .. }
                | OrchestratorError::UnsupportedTaskType { .. }
                | OrchestratorError::UnsupportedStep { .. }
                | OrchestratorError::CyclicDependency { .. }
        )
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
