use crate::util::config::LoggingConfig;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::EnvFilter, Layer, Registry};

const CRATE_TARGET: &str = "batch_classifier";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 初始化日志：标准输出 + 可选的按天滚动文件
///
/// 返回的 guard 必须在 main 中持有到进程结束，否则文件日志会丢失。
pub fn log_init_with_config(
    file_prefix: &str,
    config: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level_filter = parse_level(&config.level).unwrap_or(LevelFilter::INFO);
    let filter_expression = build_env_filter_expression(level_filter, &config.overrides);
    let use_json = config.structured.unwrap_or(false);

    let make_filter = || {
        EnvFilter::try_new(filter_expression.as_str())
            .unwrap_or_else(|_| EnvFilter::new(level_filter_to_str(level_filter)))
    };

    let stdout_layer: BoxedLayer = if use_json {
        layer()
            .json()
            .with_target(false)
            .with_writer(io::stdout)
            .with_filter(make_filter())
            .boxed()
    } else {
        layer()
            .with_target(false)
            .with_writer(io::stdout)
            .with_filter(make_filter())
            .boxed()
    };

    if !config.file.enabled {
        Registry::default().with(vec![stdout_layer]).init();
        tracing::info!(event = "log.init", level = %config.level, console = true, file = false, structured = use_json);
        return Ok(None);
    }

    let log_dir = resolve_log_dir(&config.file.directory);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = daily(&log_dir, format!("{}.log", file_prefix));
    let (no_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer: BoxedLayer = if use_json {
        layer()
            .json()
            .with_ansi(false)
            .with_writer(no_blocking)
            .with_filter(make_filter())
            .boxed()
    } else {
        layer()
            .with_ansi(false)
            .with_writer(no_blocking)
            .with_filter(make_filter())
            .boxed()
    };

    Registry::default()
        .with(vec![stdout_layer, file_layer])
        .init();

    tracing::info!(
        event = "log.init",
        level = %config.level,
        console = true,
        file = true,
        directory = %log_dir.display(),
        rotation = "daily",
        structured = use_json
    );

    if let Some(retention) = config.file.retention_days {
        tracing::info!(event = "log.retention", days = retention);
        if let Err(e) = cleanup_old_logs(&log_dir, file_prefix, retention) {
            tracing::warn!("清理旧日志失败: {}", e);
        }
    }

    Ok(Some(guard))
}

/// 相对路径基于当前工作目录；在 bin 目录下启动时使用上级目录
fn resolve_log_dir(directory: &str) -> PathBuf {
    let path = Path::new(directory);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
        if let Some(parent) = current_dir.parent() {
            return parent.join(path);
        }
    }
    current_dir.join(path)
}

pub fn cleanup_old_logs(log_dir: &Path, file_prefix: &str, retention_days: u32) -> anyhow::Result<()> {
    if !log_dir.exists() {
        tracing::debug!("日志目录不存在: {}", log_dir.display());
        return Ok(());
    }

    let retention = std::time::Duration::from_secs(retention_days as u64 * 24 * 60 * 60);
    let cutoff = std::time::SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(std::time::UNIX_EPOCH);

    let mut deleted_count = 0;
    let mut error_count = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        // 只处理本程序的日志文件
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");
        if !file_name.starts_with(file_prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .or_else(|_| metadata.created())
            .unwrap_or_else(|_| std::time::SystemTime::now());

        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    deleted_count += 1;
                    tracing::debug!("已删除过期日志: {}", path.display());
                }
                Err(e) => {
                    error_count += 1;
                    tracing::warn!("删除日志文件失败: {} - {}", path.display(), e);
                }
            }
        }
    }

    if deleted_count > 0 {
        tracing::info!("已清理 {} 个过期日志文件", deleted_count);
    }
    if error_count > 0 {
        tracing::warn!("有 {} 个文件清理失败", error_count);
    }

    Ok(())
}

fn build_env_filter_expression(
    default_level: LevelFilter,
    overrides: &HashMap<String, String>,
) -> String {
    let mut directives = vec![level_filter_to_str(default_level).to_string()];

    let mut targets: Vec<_> = overrides.iter().collect();
    targets.sort();
    for (target, level_str) in targets {
        if let Some(level) = parse_level(level_str) {
            directives.push(format!(
                "{}={}",
                normalize_directive_target(target),
                level_filter_to_str(level)
            ));
        }
    }

    directives.join(",")
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::OFF),
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

fn level_filter_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
    }
}

fn normalize_directive_target(target: &str) -> String {
    if let Some(raw) = target.strip_prefix("target:") {
        raw.to_string()
    } else if target.contains("::") {
        target.to_string()
    } else {
        format!("{}::{}", CRATE_TARGET, target.replace('.', "::"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_expression_with_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("pipeline.checkpoint".to_string(), "debug".to_string());
        overrides.insert("target:reqwest".to_string(), "warn".to_string());
        overrides.insert("pipeline".to_string(), "loud".to_string());

        let expr = build_env_filter_expression(LevelFilter::INFO, &overrides);
        assert_eq!(
            expr,
            "info,batch_classifier::pipeline::checkpoint=debug,reqwest=warn"
        );
    }

    #[test]
    fn test_cleanup_only_touches_own_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let expired = dir.path().join("batch-classifier.log.2020-01-01");
        let fresh = dir.path().join("batch-classifier.log.2020-01-02");
        let other = dir.path().join("notes.txt");
        for path in [&expired, &fresh, &other] {
            std::fs::write(path, "log").unwrap();
        }

        let month_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(30 * 24 * 60 * 60);
        for path in [&expired, &other] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(month_ago)
                .unwrap();
        }

        cleanup_old_logs(dir.path(), "batch-classifier", 7).unwrap();
        assert!(!expired.exists());
        assert!(fresh.exists());
        // 前缀不同的旧文件不处理
        assert!(other.exists());

        cleanup_old_logs(&dir.path().join("missing"), "batch-classifier", 7).unwrap();
    }
}
