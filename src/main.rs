use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use orchestrator::{EchoExecutor, OrchestrationEngine, ShutdownManager, ECHO_EXECUTOR_ID};
use orchestrator_core::{init_logging_from_config, EngineConfig, EngineEvent, Workflow};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("任务与工作流编排引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次尝试 config/orchestrator.toml 与 orchestrator.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("workflow")
                .short('w')
                .long("workflow")
                .value_name("FILE")
                .help("启动后提交的工作流定义（JSON）"),
        )
        .arg(
            Arg::new("exit-on-complete")
                .long("exit-on-complete")
                .help("工作流结束后退出")
                .requires("workflow")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("shutdown-timeout")
                .long("shutdown-timeout")
                .value_name("SECONDS")
                .help("等待引擎关闭的最长时间")
                .value_parser(clap::value_parser!(u64))
                .default_value("30"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = EngineConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {}", config_path.map_or("<默认>", |p| p.as_str())))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    init_logging_from_config(&config.observability)?;

    let shutdown_timeout = Duration::from_secs(
        matches
            .get_one::<u64>("shutdown-timeout")
            .copied()
            .unwrap_or(30),
    );
    let workflow = matches
        .get_one::<String>("workflow")
        .map(|path| load_workflow(Path::new(path)))
        .transpose()?;
    let exit_on_complete = matches.get_flag("exit-on-complete");

    info!("启动任务编排引擎");
    let engine = Arc::new(
        OrchestrationEngine::builder()
            .config(config)
            .executor(ECHO_EXECUTOR_ID, Arc::new(EchoExecutor::new()))
            .build()
            .await
            .context("构建编排引擎失败")?,
    );

    let shutdown = ShutdownManager::new();
    shutdown.listen_for_signals();

    if let Some(workflow) = workflow {
        let mut events = engine.subscribe_events();
        let workflow_id = engine
            .submit_workflow(workflow)
            .await
            .context("提交工作流失败")?;
        info!(workflow_id = %workflow_id, "工作流已提交");

        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::WorkflowFinished { workflow_id: id, .. }) if id == workflow_id => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "事件订阅落后"),
                    Err(RecvError::Closed) => return,
                }
            }
            if let Some(view) = engine.get_workflow_status(&workflow_id).await {
                match serde_json::to_string_pretty(&view) {
                    Ok(json) => info!("工作流结束:\n{json}"),
                    Err(e) => error!("序列化工作流状态失败: {e}"),
                }
            }
            if exit_on_complete {
                shutdown.trigger("工作流已结束").await;
            }
        });
    }

    shutdown.wait().await;
    info!("开始优雅关闭...");

    match tokio::time::timeout(shutdown_timeout, engine.shutdown()).await {
        Ok(()) => info!("编排引擎已优雅关闭"),
        Err(_) => warn!("引擎关闭超时（{}秒），强制退出", shutdown_timeout.as_secs()),
    }
    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取工作流文件失败: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("解析工作流文件失败: {}", path.display()))
}
