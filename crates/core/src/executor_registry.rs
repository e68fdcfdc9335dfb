use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::traits::{Executor, ExecutorRegistry};

/// 基于 `RwLock<HashMap>` 的执行器注册表
pub struct DefaultExecutorRegistry {
    executors: Arc<RwLock<HashMap<String, Arc<dyn Executor>>>>,
}

impl DefaultExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_batch(&self, executors: Vec<(String, Arc<dyn Executor>)>) {
        let mut registry = self.executors.write().await;
        for (id, executor) in executors {
            info!(executor_id = %id, "注册执行器");
            registry.insert(id, executor);
        }
    }

    pub async fn get_executor_info(&self, id: &str) -> Option<ExecutorInfo> {
        let registry = self.executors.read().await;
        registry.get(id).map(|executor| ExecutorInfo {
            id: id.to_string(),
            name: executor.name().to_string(),
            supported_task_types: executor.supported_task_types(),
        })
    }

    pub async fn get_all_executor_info(&self) -> Vec<ExecutorInfo> {
        let registry = self.executors.read().await;
        let mut infos: Vec<ExecutorInfo> = registry
            .iter()
            .map(|(id, executor)| ExecutorInfo {
                id: id.clone(),
                name: executor.name().to_string(),
                supported_task_types: executor.supported_task_types(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

impl Default for DefaultExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorRegistry for DefaultExecutorRegistry {
    async fn register(&self, id: String, executor: Arc<dyn Executor>) {
        info!(executor_id = %id, name = executor.name(), "注册执行器");
        let mut registry = self.executors.write().await;
        registry.insert(id, executor);
    }

    async fn unregister(&self, id: &str) -> bool {
        let mut registry = self.executors.write().await;
        registry.remove(id).is_some()
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn Executor>> {
        let registry = self.executors.read().await;
        registry.get(id).cloned()
    }

    async fn contains(&self, id: &str) -> bool {
        let registry = self.executors.read().await;
        registry.contains_key(id)
    }

    async fn list_executors(&self) -> Vec<String> {
        let registry = self.executors.read().await;
        let mut ids: Vec<String> = registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn all(&self) -> Vec<(String, Arc<dyn Executor>)> {
        let registry = self.executors.read().await;
        let mut executors: Vec<(String, Arc<dyn Executor>)> = registry
            .iter()
            .map(|(id, executor)| (id.clone(), Arc::clone(executor)))
            .collect();
        executors.sort_by(|a, b| a.0.cmp(&b.0));
        executors
    }

    async fn count(&self) -> usize {
        let registry = self.executors.read().await;
        registry.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorInfo {
    pub id: String,
    pub name: String,
    pub supported_task_types: Vec<String>,
}
