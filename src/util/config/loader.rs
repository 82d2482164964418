//! 配置加载和管理模块
//! 处理配置文件的读取、写入、环境变量覆盖和模板生成

use super::types::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从YAML文件读取配置
    pub fn read_yaml(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        Self::parse_yaml(&config_str)
    }

    /// 从YAML文本解析配置
    pub fn parse_yaml(content: &str) -> Result<Config> {
        let config = serde_yaml::from_str(content).context("配置文件YAML解析失败")?;
        Ok(config)
    }

    /// 从环境变量读取配置覆盖
    pub fn apply_env_overrides(config: Config) -> Config {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// 使用给定的查找函数应用覆盖，便于测试注入
    pub fn apply_overrides_from<F>(mut config: Config, lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        tracing::debug!("[tool] 应用环境变量配置覆盖...");

        if let Some(input) = lookup("CLASSIFIER_INPUT") {
            config.job.input_path = PathBuf::from(input.trim());
            tracing::info!("[ok] 环境变量覆盖输入文件: {}", config.job.input_path.display());
        }

        if let Some(output) = lookup("CLASSIFIER_OUTPUT") {
            config.job.output_path = PathBuf::from(output.trim());
            tracing::info!("[ok] 环境变量覆盖输出文件: {}", config.job.output_path.display());
        }

        if let Some(checkpoint) = lookup("CLASSIFIER_CHECKPOINT") {
            let trimmed = checkpoint.trim();
            config.job.checkpoint_path = if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            };
            tracing::info!("[ok] 环境变量覆盖检查点路径: {:?}", config.job.checkpoint_path);
        }

        if let Some(column) = lookup("CLASSIFIER_TEXT_COLUMN") {
            config.job.text_column = column.clone();
            tracing::info!("[ok] 环境变量覆盖文本列: {}", column);
        }

        if let Some(raw) = lookup("CLASSIFIER_CONCURRENCY") {
            match raw.trim().parse::<usize>() {
                Ok(value) => {
                    config.pipeline.concurrency = value;
                    tracing::info!("[ok] 环境变量覆盖并发数: {}", value);
                }
                Err(_) => tracing::warn!("[warn] CLASSIFIER_CONCURRENCY 无效: {}", raw),
            }
        }

        if let Some(raw) = lookup("CLASSIFIER_MAX_RETRIES") {
            match raw.trim().parse::<u32>() {
                Ok(value) => {
                    config.pipeline.max_retries = value;
                    tracing::info!("[ok] 环境变量覆盖最大尝试次数: {}", value);
                }
                Err(_) => tracing::warn!("[warn] CLASSIFIER_MAX_RETRIES 无效: {}", raw),
            }
        }

        if let Some(raw) = lookup("CLASSIFIER_REQUEST_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(value) => {
                    config.pipeline.request_timeout_secs = value;
                    tracing::info!("[ok] 环境变量覆盖请求超时: {}s", value);
                }
                Err(_) => tracing::warn!("[warn] CLASSIFIER_REQUEST_TIMEOUT_SECS 无效: {}", raw),
            }
        }

        if let Some(flag) = lookup("CLASSIFIER_CHECKPOINT_ENABLED") {
            match Self::parse_bool(&flag) {
                Ok(enabled) => {
                    config.checkpoint.enabled = enabled;
                    tracing::info!("[ok] 环境变量覆盖检查点开关: {}", enabled);
                }
                Err(_) => tracing::warn!(
                    "[warn] CLASSIFIER_CHECKPOINT_ENABLED 无法解析为布尔值: {}",
                    flag
                ),
            }
        }

        // Oracle 配置覆盖（密钥不打印明文）
        if let Some(endpoint) = lookup("CLASSIFIER_ORACLE_ENDPOINT") {
            config.oracle.endpoint = endpoint.trim().to_string();
            tracing::info!("[ok] 环境变量覆盖Oracle地址: {}", config.oracle.endpoint);
        }

        if let Some(api_key) = lookup("CLASSIFIER_ORACLE_API_KEY") {
            config.oracle.api_key = api_key.trim().to_string();
            tracing::info!("[ok] 环境变量覆盖Oracle API Key: [安全隐藏]");
        }

        if let Some(model) = lookup("CLASSIFIER_ORACLE_MODEL") {
            config.oracle.model = model.trim().to_string();
            tracing::info!("[ok] 环境变量覆盖Oracle模型: {}", config.oracle.model);
        }

        if let Some(proxy) = lookup("HTTP_PROXY") {
            config.oracle.http.http_proxy = Some(proxy);
        }
        if let Some(proxy) = lookup("HTTPS_PROXY") {
            config.oracle.http.https_proxy = Some(proxy);
        }

        // 日志配置覆盖
        if let Some(level) = lookup("CLASSIFIER_LOG_LEVEL") {
            config.logging.level = level.trim().to_ascii_lowercase();
            tracing::info!("[ok] 环境变量覆盖日志级别: {}", config.logging.level);
        }

        if let Some(log_retention) = lookup("CLASSIFIER_LOG_RETENTION") {
            if let Ok(retention_days) = log_retention.trim().parse::<u32>() {
                config.logging.file.retention_days = Some(retention_days);
                tracing::info!("[ok] 环境变量覆盖日志保留天数: {}", retention_days);
            }
        }

        config
    }

    /// 解析布尔环境变量
    fn parse_bool(value: &str) -> Result<bool, ()> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            _ => Err(()),
        }
    }

    /// 配置加载（配置文件 + 环境变量）
    pub fn load_with_env_overrides(path: impl AsRef<Path>) -> Result<Config> {
        let base_config = Self::read_yaml(path)?;
        let config = Self::apply_env_overrides(base_config);
        tracing::info!("[ok] 配置加载完成");
        Ok(config)
    }
}

/// 配置写入器
pub struct ConfigWriter;

impl ConfigWriter {
    /// 写入YAML文件，必要时创建父目录
    pub fn write_yaml_with_dir(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建配置目录失败: {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(config).context("序列化配置失败")?;
        fs::write(path, yaml).with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }

    /// 生成配置模板
    pub fn generate_template() -> Config {
        Config {
            job: JobConfig {
                input_path: PathBuf::from("data/input.csv"),
                output_path: PathBuf::from("data/classified.csv"),
                checkpoint_path: None,
                text_column: "Speciality".to_string(),
                delimiter: ',',
            },
            pipeline: PipelineConfig::default(),
            checkpoint: CheckpointConfig::default(),
            output: OutputColumnsConfig::default(),
            taxonomy: TaxonomyConfig {
                categories: vec![
                    CategoryConfig {
                        name: "Engineering".to_string(),
                        subcategories: vec![
                            "Computer Science".to_string(),
                            "Civil Engineering".to_string(),
                            "Electrical Engineering".to_string(),
                        ],
                    },
                    CategoryConfig {
                        name: "Business".to_string(),
                        subcategories: vec!["Finance".to_string(), "Marketing".to_string()],
                    },
                    CategoryConfig {
                        name: "Medicine".to_string(),
                        subcategories: vec!["Nursing".to_string(), "Pharmacy".to_string()],
                    },
                ],
            },
            oracle: OracleConfig {
                endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key: String::new(),
                model: "gpt-4o".to_string(),
                temperature: 0.0,
                system_prompt: None,
                http: HttpSettings::default(),
            },
            logging: LoggingConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_template_round_trips_through_yaml() {
        let template = ConfigWriter::generate_template();
        let yaml = serde_yaml::to_string(&template).unwrap();
        let parsed = ConfigLoader::parse_yaml(&yaml).unwrap();
        assert_eq!(parsed.job.text_column, "Speciality");
        assert_eq!(parsed.taxonomy.categories.len(), 3);
        assert_eq!(parsed.pipeline.concurrency, 5);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
job:
  input_path: in.csv
  output_path: out/result.csv
  text_column: Major
taxonomy:
  categories:
    - name: Arts
oracle:
  endpoint: http://127.0.0.1:9000/v1/chat/completions
"#;
        let config = ConfigLoader::parse_yaml(yaml).unwrap();
        assert_eq!(config.pipeline.concurrency, 5);
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.job.delimiter, ',');
        assert!(config.checkpoint.enabled);
        assert_eq!(
            config.job.checkpoint_path(),
            PathBuf::from("out/result.checkpoint.csv")
        );
        assert_eq!(config.output.category_column, "Classified Field");
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigWriter::generate_template();
        let lookup = lookup_from(&[
            ("CLASSIFIER_CONCURRENCY", "8"),
            ("CLASSIFIER_MAX_RETRIES", "oops"),
            ("CLASSIFIER_ORACLE_API_KEY", " sk-test "),
            ("CLASSIFIER_CHECKPOINT_ENABLED", "no"),
            ("CLASSIFIER_INPUT", "other.csv"),
        ]);
        let config = ConfigLoader::apply_overrides_from(config, lookup);
        assert_eq!(config.pipeline.concurrency, 8);
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.oracle.api_key, "sk-test");
        assert!(!config.checkpoint.enabled);
        assert_eq!(config.job.input_path, PathBuf::from("other.csv"));
    }

    #[test]
    fn test_checkpoint_threshold() {
        let mut cfg = CheckpointConfig::default();
        assert_eq!(cfg.threshold(200), 20);
        assert_eq!(cfg.threshold(5), 1);
        assert_eq!(cfg.threshold(0), 1);
        cfg.every_records = Some(7);
        assert_eq!(cfg.threshold(200), 7);
        cfg.every_records = Some(0);
        assert_eq!(cfg.threshold(200), 1);
    }

    #[test]
    fn test_write_yaml_creates_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config").join("config.yaml");
        ConfigWriter::write_yaml_with_dir(&ConfigWriter::generate_template(), &path).unwrap();
        let loaded = ConfigLoader::read_yaml(&path).unwrap();
        assert_eq!(loaded.oracle.model, "gpt-4o");
    }
}
