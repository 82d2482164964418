//! 配置结构定义模块
//! 包含分类任务的所有配置数据结构

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// 主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: JobConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub output: OutputColumnsConfig,
    pub taxonomy: TaxonomyConfig,
    pub oracle: OracleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

/// 任务输入输出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// 未配置时使用 `<output>.checkpoint.csv`
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    pub text_column: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl JobConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path.clone().unwrap_or_else(|| {
            let mut name = self
                .output_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "output".to_string());
            name.push_str(".checkpoint.csv");
            self.output_path.with_file_name(name)
        })
    }

    pub fn delimiter_byte(&self) -> u8 {
        if self.delimiter.is_ascii() {
            self.delimiter as u8
        } else {
            b','
        }
    }
}

/// 流水线并发与重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// 重试退避配置（指数退避，限流错误额外放大）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
        }
    }
}

/// 检查点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 每新增该百分比的终态记录写一次检查点
    #[serde(default = "default_checkpoint_percent")]
    pub every_percent: f64,
    /// 按条数触发，配置后优先于百分比
    #[serde(default)]
    pub every_records: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_percent: default_checkpoint_percent(),
            every_records: None,
        }
    }
}

impl CheckpointConfig {
    /// 计算触发阈值（至少为1）
    pub fn threshold(&self, total: usize) -> usize {
        let raw = match self.every_records {
            Some(count) => count,
            None => {
                let percent = self.every_percent.clamp(0.0, 100.0);
                ((total as f64) * percent / 100.0).ceil() as usize
            }
        };
        raw.max(1)
    }
}

/// 输出追加列名称
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputColumnsConfig {
    #[serde(default = "default_category_column")]
    pub category_column: String,
    #[serde(default = "default_subcategory_column")]
    pub subcategory_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_attempts_column")]
    pub attempts_column: String,
}

impl Default for OutputColumnsConfig {
    fn default() -> Self {
        Self {
            category_column: default_category_column(),
            subcategory_column: default_subcategory_column(),
            status_column: default_status_column(),
            attempts_column: default_attempts_column(),
        }
    }
}

impl OutputColumnsConfig {
    pub fn names(&self) -> [&str; 4] {
        [
            self.category_column.as_str(),
            self.subcategory_column.as_str(),
            self.status_column.as_str(),
            self.attempts_column.as_str(),
        ]
    }
}

/// 分类体系配置：一级类别及其允许的二级类别
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
}

/// 外部分类服务配置（OpenAI 兼容 chat completions 接口）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    /// 为空时使用内置提示词
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub http: HttpSettings,
}

/// HTTP 客户端参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            http_proxy: None,
            https_proxy: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: LogFileConfig,
    #[serde(default)]
    pub structured: Option<bool>,
    /// 按模块覆盖日志级别，例如 `pipeline.checkpoint: debug`
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: LogFileConfig::default(),
            structured: None,
            overrides: HashMap::new(),
        }
    }
}

/// 日志文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileConfig {
    pub enabled: bool,
    pub directory: String,
    pub retention_days: Option<u32>,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "logs".to_string(),
            retention_days: Some(7),
        }
    }
}

/// 进度输出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_interval_secs")]
    pub log_interval_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            log_interval_secs: default_progress_interval_secs(),
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_rate_limit_multiplier() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_percent() -> f64 {
    10.0
}

fn default_category_column() -> String {
    "Classified Field".to_string()
}

fn default_subcategory_column() -> String {
    "Classified Major".to_string()
}

fn default_status_column() -> String {
    "Classification Status".to_string()
}

fn default_attempts_column() -> String {
    "Classification Attempts".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("batch-classifier/{}", env!("CARGO_PKG_VERSION"))
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_interval_secs() -> u64 {
    15
}
