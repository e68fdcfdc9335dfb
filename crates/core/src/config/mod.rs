//! 引擎配置
//!
//! 加载顺序：
//! 1. 默认值
//! 2. 配置文件（TOML）
//! 3. 环境变量覆盖（前缀 `ORCHESTRATOR_`，层级分隔符 `__`，例如
//!    `ORCHESTRATOR_WORKER__WORKER_COUNT=8`）

mod models;

pub use models::*;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerPoolConfig,
    pub dispatcher: DispatcherConfig,
    pub workflow: WorkflowConfig,
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// `config_path` 为 `None` 时依次尝试默认路径，都不存在则只使用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ORCHESTRATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate().context("Worker池配置验证失败")?;
        self.dispatcher
            .validate()
            .context("Dispatcher配置验证失败")?;
        self.workflow.validate().context("工作流配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.worker_count, 4);
        assert!(!config.dispatcher.priority_ordering);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [worker]
            worker_count = 8

            [dispatcher]
            priority_ordering = true
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.worker_count, 8);
        assert_eq!(config.worker.status_poll_interval_ms, 1000);
        assert!(config.dispatcher.priority_ordering);
        assert_eq!(config.workflow, WorkflowConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml("[worker]\nworker_count = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("Worker数量必须大于0"));

        let err = EngineConfig::from_toml("[observability]\nlog_format = \"xml\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("无效的日志格式"));

        let err =
            EngineConfig::from_toml("[workflow]\nmax_finished_workflows = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("已结束工作流保留数量必须大于0"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[workflow]\ndefault_step_timeout_seconds = 42").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.workflow.default_step_timeout_seconds, 42);
        assert_eq!(config.worker, WorkerPoolConfig::default());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(EngineConfig::load(Some("/nonexistent/orchestrator.toml")).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }
}
