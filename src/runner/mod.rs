//! 任务启动模块
//!
//! 负责按配置装配流水线、处理停止信号并输出运行结果。

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use config::ConfigManager;

use crate::build_info;
use crate::model::Taxonomy;
use crate::pipeline::{self, CheckpointManager, Oracle, Pipeline, ProgressReporter, RunSummary, StoreHandle};
use crate::util::config::{Config, ConfigValidator, ValidationReport};
use crate::util::logging::standards::events;

/// 命令行传入的路径，优先于配置文件
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl RunArgs {
    pub fn from_args(mut args: impl Iterator<Item = String>) -> Self {
        Self {
            input: args.next().map(PathBuf::from),
            output: args.next().map(PathBuf::from),
        }
    }

    fn apply(&self, config: &mut Config) {
        if let Some(input) = &self.input {
            config.job.input_path = input.clone();
        }
        if let Some(output) = &self.output {
            config.job.output_path = output.clone();
        }
    }
}

/// 运行分类任务
pub async fn start_job(args: RunArgs) -> Result<RunSummary> {
    let (mut config, _) = ConfigManager::load_and_validate()?;
    args.apply(&mut config);
    let report = ConfigValidator::validate_all(&config);
    ensure_valid(&report)?;

    let _log_guard = ConfigManager::initialize_logging(&config)?;
    info!("=== 批量分类任务启动 ===");
    info!("版本信息: {}", build_info::summary());

    let oracle = build_oracle(&config)?;
    let pipeline = Pipeline::from_config(&config, oracle)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let result = pipeline.run(cancel).await;
    signal_task.abort();

    match &result {
        Ok(summary) => {
            print_summary(summary, &config);
            if summary.cancelled {
                info!(
                    checkpoint = %config.job.checkpoint_path().display(),
                    "任务已中断，再次运行将从检查点继续"
                );
            }
        }
        Err(e) => error!(event = events::JOB_ERROR, error = %format!("{:#}", e), "分类任务失败"),
    }
    result
}

/// 查看任务进度：读取输入与检查点，不发起任何分类请求
pub fn show_status() -> Result<()> {
    let (config, report) = ConfigManager::load_and_validate()?;
    ensure_valid(&report)?;

    let taxonomy = Taxonomy::from_config(&config.taxonomy).context("分类体系配置无效")?;
    let mut store = pipeline::load_store(&config)?;
    let checkpoint_path = config.job.checkpoint_path();
    let manager = CheckpointManager::new(&checkpoint_path, &config.checkpoint, store.len());

    let layout = store.layout().clone();
    match manager.load_checkpoint(layout.delimiter, &layout.columns) {
        Some(mut snapshot) => {
            let relabelled = snapshot.revalidate_labels(&taxonomy);
            match store.seed_from_checkpoint(&snapshot) {
                Ok(summary) => println!(
                    "检查点: {}（恢复 {} 条终态记录，{} 条标签不在当前分类体系内将重新分类）",
                    checkpoint_path.display(),
                    summary.restored_terminal,
                    relabelled
                ),
                Err(e) => println!("检查点与输入不一致，将被忽略: {}", e),
            }
        }
        None => println!("未找到可用的检查点: {}", checkpoint_path.display()),
    }

    print_progress(&ProgressReporter::new(StoreHandle::new(store)));
    Ok(())
}

/// 校验配置与分类体系并打印报告
pub fn check_config() -> Result<()> {
    let (config, report) = ConfigManager::load_and_validate()?;

    println!("版本信息: {}", build_info::summary());
    for issue in &report.errors {
        println!("[error] {}: {}", issue.field, issue.message);
    }
    for issue in &report.warnings {
        println!("[warn]  {}: {}", issue.field, issue.message);
    }
    for issue in &report.info {
        println!("[info]  {}: {}", issue.field, issue.message);
    }

    if let Ok(taxonomy) = Taxonomy::from_config(&config.taxonomy) {
        println!(
            "分类体系: {} 个类别，{} 个二级类别",
            taxonomy.category_count(),
            taxonomy.pair_count()
        );
    }
    println!(
        "配置检查: {} 个错误，{} 个警告",
        report.error_count(),
        report.warning_count()
    );
    ensure_valid(&report)
}

fn ensure_valid(report: &ValidationReport) -> Result<()> {
    if report.has_errors() {
        return Err(anyhow!("配置验证失败: {} 个错误", report.error_count()));
    }
    Ok(())
}

#[cfg(feature = "reqwest")]
fn build_oracle(config: &Config) -> Result<Arc<dyn Oracle>> {
    let taxonomy = Taxonomy::from_config(&config.taxonomy).context("分类体系配置无效")?;
    let oracle = pipeline::client::HttpOracle::new(
        &config.oracle,
        &taxonomy,
        config.pipeline.request_timeout(),
    )?;
    Ok(Arc::new(oracle))
}

#[cfg(not(feature = "reqwest"))]
fn build_oracle(_config: &Config) -> Result<Arc<dyn Oracle>> {
    Err(anyhow!("当前编译未启用 reqwest 特性，无法访问分类服务"))
}

fn print_progress(reporter: &ProgressReporter) {
    let p = reporter.snapshot();
    println!(
        "进度: {:.1}% （完成 {}，失败 {}，待处理 {}，共 {}）",
        p.percent,
        p.completed,
        p.failed,
        p.pending + p.in_flight,
        p.total
    );
    for (label, count) in reporter.label_distribution() {
        println!("  {:<40} {}", label, count);
    }
}

fn print_summary(summary: &RunSummary, config: &Config) {
    println!(
        "共 {} 条：完成 {}（其中未归类 {}），失败 {}，本次派发 {}，恢复 {}，耗时 {:.1}s",
        summary.total,
        summary.completed,
        summary.unclassified,
        summary.failed,
        summary.dispatched,
        summary.resumed,
        summary.elapsed.as_secs_f64()
    );
    if summary.is_complete() {
        println!("输出文件: {}", config.job.output_path.display());
    }
    for (label, count) in &summary.distribution {
        println!("  {:<40} {}", label, count);
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    tokio::select! {
        result = ctrl_c() => {
            if let Err(e) = result {
                warn!("监听 Ctrl+C 失败: {}", e);
                std::future::pending::<()>().await;
            }
            info!(event = events::JOB_CANCELLED, signal = "SIGINT");
        }
        _ = wait_for_sigterm() => {
            info!(event = events::JOB_CANCELLED, signal = "SIGTERM");
        }
    }
}

async fn wait_for_sigterm() {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                warn!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_paths_override_config() {
        let mut config = Config::default();
        let args = RunArgs::from_args(["in.tsv".to_string(), "out.tsv".to_string()].into_iter());
        args.apply(&mut config);
        assert_eq!(config.job.input_path, PathBuf::from("in.tsv"));
        assert_eq!(config.job.output_path, PathBuf::from("out.tsv"));

        let mut config = Config::default();
        RunArgs::from_args(std::iter::empty()).apply(&mut config);
        assert_eq!(config.job.input_path, PathBuf::from("data/input.csv"));
    }

    #[test]
    fn test_ensure_valid() {
        let mut report = ValidationReport::new();
        assert!(ensure_valid(&report).is_ok());
        report.add_error("job.text_column", "文本列名不能为空");
        assert!(ensure_valid(&report).is_err());
    }
}
