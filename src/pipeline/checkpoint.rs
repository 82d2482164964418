//! 检查点管理
//!
//! 检查点与最终输出使用同一表格格式。写入走临时文件 + fsync + rename，
//! 任何时刻磁盘上都是一份完整的快照。读取失败按“没有检查点”处理。
//! 写文件在阻塞线程池中进行，调度协程只负责复制一份存储。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};

use super::store::{CheckpointSnapshot, RecordStore, SnapshotRow, StoreHandle};
use crate::model::{Label, RecordStatus};
use crate::util::config::types::{CheckpointConfig, OutputColumnsConfig};
use crate::util::logging::standards::events;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("检查点文件IO失败: {0}")]
    Io(#[from] io::Error),
    #[error("检查点文件解析失败: {0}")]
    Csv(#[from] csv::Error),
    #[error("检查点文件替换失败: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("检查点格式不正确（第 {row} 行）: {message}")]
    Format { row: usize, message: String },
    #[error("写入任务异常退出: {0}")]
    Task(#[from] task::JoinError),
}

/// 以输出格式原子写出整张表
pub fn write_table_atomic(path: &Path, store: &RecordStore) -> Result<(), CheckpointError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    store.write_to(io::BufWriter::new(tmp.as_file_mut()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// 复制当前存储并在阻塞线程池中原子写出
pub async fn persist_table(path: &Path, store: &StoreHandle) -> Result<(), CheckpointError> {
    let copy = store.read().clone();
    persist_copy(path.to_path_buf(), copy).await
}

async fn persist_copy(path: PathBuf, copy: RecordStore) -> Result<(), CheckpointError> {
    task::spawn_blocking(move || write_table_atomic(&path, &copy)).await?
}

/// 读取检查点文件
///
/// 表头末尾必须是配置的四个追加列，之前的列视为原始输入表头。
pub fn read_snapshot(
    path: &Path,
    delimiter: u8,
    columns: &OutputColumnsConfig,
) -> Result<CheckpointSnapshot, CheckpointError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)?;

    let all_headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let names = columns.names();
    let split = all_headers
        .len()
        .checked_sub(names.len())
        .filter(|&at| all_headers[at..].iter().map(String::as_str).eq(names))
        .ok_or_else(|| CheckpointError::Format {
            row: 0,
            message: format!("表头缺少追加列 [{}]", names.join(", ")),
        })?;

    let mut rows = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let line = idx + 1;
        let format_err = |message: String| CheckpointError::Format { row: line, message };

        let fields: Vec<String> = row.iter().take(split).map(str::to_string).collect();
        let tail = |offset: usize| row.get(split + offset).unwrap_or("");

        let status: RecordStatus = tail(2)
            .parse()
            .map_err(|_| format_err(format!("未知状态 `{}`", tail(2))))?;
        let attempts = match tail(3).trim() {
            "" => 0,
            raw => raw
                .parse::<u32>()
                .map_err(|_| format_err(format!("尝试次数无效 `{}`", raw)))?,
        };

        rows.push(SnapshotRow {
            fields,
            status,
            label: Label::from_columns(tail(0), tail(1)),
            attempts,
        });
    }

    Ok(CheckpointSnapshot {
        headers: all_headers[..split].to_vec(),
        rows,
    })
}

/// 检查点管理器
///
/// 由合并器在每次写入后调用 [`maybe_checkpoint`](Self::maybe_checkpoint)。
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    enabled: bool,
    threshold: usize,
    /// 上次成功写入时的终态记录数
    last_terminal: usize,
    writes: usize,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, config: &CheckpointConfig, total: usize) -> Self {
        Self {
            path: path.into(),
            enabled: config.enabled,
            threshold: config.threshold(total),
            last_terminal: 0,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// 启动时读取一次；不存在或无法解析都返回 None
    pub fn load_checkpoint(
        &self,
        delimiter: u8,
        columns: &OutputColumnsConfig,
    ) -> Option<CheckpointSnapshot> {
        if !self.enabled || !self.path.exists() {
            return None;
        }
        match read_snapshot(&self.path, delimiter, columns) {
            Ok(snapshot) => {
                info!(
                    event = events::CHECKPOINT_LOAD,
                    path = %self.path.display(),
                    rows = snapshot.rows.len(),
                    "已读取检查点"
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    event = events::CHECKPOINT_IGNORED,
                    path = %self.path.display(),
                    error = %e,
                    "检查点无法读取，按全新任务处理"
                );
                None
            }
        }
    }

    /// 以当前终态数作为基线（从检查点恢复后调用）
    pub fn set_baseline(&mut self, store: &RecordStore) {
        self.last_terminal = store.counts().terminal();
    }

    /// 新增终态数达到阈值，或全部记录都已进入终态
    pub fn is_due(&self, store: &RecordStore) -> bool {
        if !self.enabled {
            return false;
        }
        let delta = store.counts().terminal().saturating_sub(self.last_terminal);
        delta >= self.threshold || (store.is_finished() && delta > 0)
    }

    /// 到达写入条件时写入；失败只记录日志，保留上一份检查点
    pub async fn maybe_checkpoint(&mut self, store: &StoreHandle) -> bool {
        let copy = {
            let guard = store.read();
            if !self.is_due(&guard) {
                return false;
            }
            guard.clone()
        };
        match self.write(copy).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    event = events::CHECKPOINT_WRITE_FAILED,
                    path = %self.path.display(),
                    error = %e,
                    "写入检查点失败，保留上一份检查点"
                );
                false
            }
        }
    }

    /// 无条件写入（启动与取消时使用）
    pub async fn flush(&mut self, store: &StoreHandle) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        let copy = store.read().clone();
        self.write(copy).await
    }

    /// 任务完成后删除检查点
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(
                event = events::CHECKPOINT_REMOVE,
                path = %self.path.display(),
                "任务完成，已删除检查点"
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                event = events::CHECKPOINT_REMOVE,
                path = %self.path.display(),
                error = %e,
                "删除检查点失败"
            ),
        }
    }

    async fn write(&mut self, copy: RecordStore) -> Result<(), CheckpointError> {
        let terminal = copy.counts().terminal();
        let total = copy.len();
        persist_copy(self.path.clone(), copy).await?;
        self.last_terminal = terminal;
        self.writes += 1;
        debug!(
            event = events::CHECKPOINT_WRITE,
            path = %self.path.display(),
            terminal,
            total,
            "检查点已写入"
        );
        Ok(())
    }
}
