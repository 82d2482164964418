//! 配置管理模块
//! 负责配置文件的查找、加载、验证和日志初始化

use crate::util::config::{Config, ConfigLoader, ConfigValidator, ValidationReport};
use crate::util::log::log_init_with_config;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
const LOG_FILE_PREFIX: &str = "batch-classifier";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 加载和验证配置
    pub fn load_and_validate() -> Result<(Config, ValidationReport)> {
        let config_path = Self::find_config_file_path(CONFIG_FILE_NAME);
        Self::load_and_validate_from(&config_path)
    }

    pub fn load_and_validate_from(config_path: &Path) -> Result<(Config, ValidationReport)> {
        info!("配置文件路径: {}", config_path.display());

        let config = match ConfigLoader::load_with_env_overrides(config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("[warn] 配置文件读取失败: {} - {}", config_path.display(), e);
                return Err(Self::handle_config_load_failure(config_path, e));
            }
        };

        let report = ConfigValidator::validate_all(&config);
        Self::log_report(&report);
        Ok((config, report))
    }

    /// 初始化日志系统，返回的 guard 需要保持到进程退出
    pub fn initialize_logging(config: &Config) -> Result<Option<WorkerGuard>> {
        log_init_with_config(LOG_FILE_PREFIX, &config.logging)
    }

    /// 查找配置文件路径，适应开发和部署目录结构
    pub fn find_config_file_path(filename: &str) -> PathBuf {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        // 情况1：当前目录下的 config/
        let config_in_current = current_dir.join("config").join(filename);
        if config_in_current.exists() {
            return config_in_current;
        }

        // 情况2：在 bin/ 目录启动时使用上级目录的 config/
        if let Some(parent) = current_dir.parent() {
            let config_in_parent = parent.join("config").join(filename);
            if config_in_parent.exists() {
                return config_in_parent;
            }
        }

        // 情况3：可执行文件位于 bin/ 时检查项目根目录
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            if exe_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
                if let Some(project_root) = exe_dir.parent() {
                    let config_in_root = project_root.join("config").join(filename);
                    if config_in_root.exists() {
                        return config_in_root;
                    }
                }
            }
        }

        // 情况4：当前目录
        current_dir.join(filename)
    }

    /// 配置文件不存在时写出模板，提示用户修改后重新运行
    fn handle_config_load_failure(config_path: &Path, cause: anyhow::Error) -> anyhow::Error {
        if config_path.exists() {
            return cause.context(format!("配置文件解析失败: {}", config_path.display()));
        }

        let template = Config::default();
        match template.write_yaml_to_path(config_path) {
            Ok(()) => anyhow!(
                "未找到配置文件，已生成模板: {}，请填写 job 与 oracle 配置后重新运行",
                config_path.display()
            ),
            Err(write_err) => anyhow!(
                "未找到配置文件 {}，且创建模板失败: {}",
                config_path.display(),
                write_err
            ),
        }
    }

    fn log_report(report: &ValidationReport) {
        if report.has_errors() {
            warn!("[warn] 配置验证发现错误: {}", report.error_count());
            for error in &report.errors {
                warn!("  - {}: {}", error.field, error.message);
            }
        }
        if report.warning_count() > 0 {
            info!("配置验证发现警告: {}", report.warning_count());
            for warning in &report.warnings {
                info!("  - {}: {}", warning.field, warning.message);
            }
        }
    }
}
