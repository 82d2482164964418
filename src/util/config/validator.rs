//! 配置验证模块
//! 提供配置的验证、检查和诊断功能

use super::types::*;
use crate::model::taxonomy::Taxonomy;
use url::Url;

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 全面验证配置
    pub fn validate_all(config: &Config) -> ValidationReport {
        let mut report = ValidationReport::new();

        Self::validate_job_config(&config.job, &mut report);
        Self::validate_pipeline_config(&config.pipeline, &mut report);
        Self::validate_checkpoint_config(&config.checkpoint, &mut report);
        Self::validate_output_columns(config, &mut report);
        Self::validate_taxonomy_config(&config.taxonomy, &mut report);
        Self::validate_oracle_config(&config.oracle, &mut report);
        Self::validate_logging_config(&config.logging, &mut report);

        report
    }

    /// 验证任务配置
    fn validate_job_config(job: &JobConfig, report: &mut ValidationReport) {
        if job.text_column.trim().is_empty() {
            report.add_error("job.text_column", "文本列名不能为空");
        }

        if !job.delimiter.is_ascii() || job.delimiter == '"' || job.delimiter == '\n' {
            report.add_error(
                "job.delimiter",
                &format!("分隔符必须是单个ASCII字符且不能是引号或换行: {:?}", job.delimiter),
            );
        }

        if job.input_path == job.output_path {
            report.add_error("job.output_path", "输出文件不能与输入文件相同");
        }

        let checkpoint = job.checkpoint_path();
        if checkpoint == job.output_path || checkpoint == job.input_path {
            report.add_error(
                "job.checkpoint_path",
                "检查点文件不能与输入或输出文件相同",
            );
        }

        if !job.input_path.exists() {
            report.add_warning(
                "job.input_path",
                &format!("输入文件当前不存在: {}", job.input_path.display()),
            );
        }
    }

    /// 验证并发与重试配置
    fn validate_pipeline_config(pipeline: &PipelineConfig, report: &mut ValidationReport) {
        if pipeline.concurrency == 0 {
            report.add_error("pipeline.concurrency", "并发数必须大于0");
        } else if pipeline.concurrency > 64 {
            report.add_warning(
                "pipeline.concurrency",
                &format!("并发数 {} 过高，可能触发外部服务限流", pipeline.concurrency),
            );
        }

        if pipeline.max_retries == 0 {
            report.add_error("pipeline.max_retries", "最大尝试次数必须大于0");
        }

        if pipeline.request_timeout_secs == 0 {
            report.add_error("pipeline.request_timeout_secs", "请求超时必须大于0");
        }

        if pipeline.backoff.max_ms < pipeline.backoff.base_ms {
            report.add_warning(
                "pipeline.backoff.max_ms",
                "退避上限小于基础退避时间，将以上限为准",
            );
        }

        if pipeline.backoff.rate_limit_multiplier == 0 {
            report.add_warning(
                "pipeline.backoff.rate_limit_multiplier",
                "限流退避倍数为0，将按1处理",
            );
        }
    }

    /// 验证检查点配置
    fn validate_checkpoint_config(checkpoint: &CheckpointConfig, report: &mut ValidationReport) {
        if !checkpoint.enabled {
            report.add_info("checkpoint.enabled", "检查点已禁用，任务中断后需要重新开始");
            return;
        }

        if checkpoint.every_records.is_none()
            && !(checkpoint.every_percent > 0.0 && checkpoint.every_percent <= 100.0)
        {
            report.add_error(
                "checkpoint.every_percent",
                &format!(
                    "检查点百分比必须在 (0, 100] 范围内: {}",
                    checkpoint.every_percent
                ),
            );
        }

        if checkpoint.every_records == Some(0) {
            report.add_warning("checkpoint.every_records", "按条数触发为0，将按每条写入处理");
        }
    }

    /// 验证输出列名
    fn validate_output_columns(config: &Config, report: &mut ValidationReport) {
        let names = config.output.names();
        for (idx, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                report.add_error("output", "输出列名不能为空");
            }
            if names[..idx].contains(name) {
                report.add_error("output", &format!("输出列名重复: {}", name));
            }
            if *name == config.job.text_column {
                report.add_error(
                    "output",
                    &format!("输出列名与文本列冲突: {}", name),
                );
            }
        }
    }

    /// 验证分类体系
    fn validate_taxonomy_config(taxonomy: &TaxonomyConfig, report: &mut ValidationReport) {
        match Taxonomy::from_config(taxonomy) {
            Ok(parsed) => {
                report.add_info(
                    "taxonomy",
                    &format!(
                        "分类体系包含 {} 个一级类别、{} 个二级类别",
                        parsed.category_count(),
                        parsed.pair_count()
                    ),
                );
            }
            Err(err) => report.add_error("taxonomy", &err.to_string()),
        }
    }

    /// 验证外部分类服务配置
    fn validate_oracle_config(oracle: &OracleConfig, report: &mut ValidationReport) {
        match Url::parse(oracle.endpoint.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                if url.scheme() == "http" && !oracle.api_key.is_empty() {
                    report.add_warning(
                        "oracle.endpoint",
                        "使用明文HTTP传输API Key，建议改用HTTPS",
                    );
                }
            }
            Ok(url) => report.add_error(
                "oracle.endpoint",
                &format!("不支持的协议: {}", url.scheme()),
            ),
            Err(err) => report.add_error(
                "oracle.endpoint",
                &format!("Oracle地址解析失败: {}", err),
            ),
        }

        if oracle.api_key.is_empty() {
            report.add_warning(
                "oracle.api_key",
                "未配置API Key，可通过 CLASSIFIER_ORACLE_API_KEY 提供",
            );
        }

        if oracle.model.trim().is_empty() {
            report.add_error("oracle.model", "模型名称不能为空");
        }

        if !(0.0..=2.0).contains(&oracle.temperature) {
            report.add_error(
                "oracle.temperature",
                &format!("temperature 必须在 [0, 2] 范围内: {}", oracle.temperature),
            );
        }

        for (field, proxy) in [
            ("oracle.http.http_proxy", &oracle.http.http_proxy),
            ("oracle.http.https_proxy", &oracle.http.https_proxy),
        ] {
            if let Some(proxy) = proxy.as_ref().filter(|p| !p.is_empty()) {
                if Url::parse(proxy).is_err() {
                    report.add_warning(field, &format!("代理地址无效，将被忽略: {}", proxy));
                }
            }
        }
    }

    /// 验证日志配置
    fn validate_logging_config(logging: &LoggingConfig, report: &mut ValidationReport) {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&logging.level.to_lowercase().as_str()) {
            report.add_warning(
                "logging.level",
                &format!("无效的日志级别 {}，将使用 info", logging.level),
            );
        }

        if logging.file.enabled && logging.file.directory.trim().is_empty() {
            report.add_error("logging.file.directory", "启用文件日志时目录不能为空");
        }
    }
}

/// 验证报告
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_info(&mut self, field: &str, message: &str) {
        self.info.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }
}

/// 验证问题
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}
