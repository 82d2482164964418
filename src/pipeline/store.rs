//! 记录存储
//!
//! 按行号保存全部输入记录及其分类状态。`apply` 是唯一的修改入口，只由
//! 结果合并器调用；读取方通过 [`StoreHandle::read`] 获取短暂的共享锁。

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::model::{Label, Record, RecordId, RecordStatus, Taxonomy};
use crate::util::config::types::OutputColumnsConfig;

/// 输入数据结构错误，发生时整个任务在派发前终止
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("输入文件缺少表头")]
    EmptyHeader,
    #[error("输入文件缺少必需的文本列 `{column}`，现有列: {available}")]
    MissingColumn { column: String, available: String },
    #[error("输入列 `{0}` 与输出追加列同名")]
    ColumnConflict(String),
    #[error("第 {row} 行无法解析: {message}")]
    Malformed { row: usize, message: String },
    #[error("读取输入失败: {0}")]
    Io(#[from] io::Error),
}

/// 状态转换错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("记录 {0} 不存在")]
    UnknownId(RecordId),
    #[error("记录 {id} 不能从 {from} 转换到 {to}")]
    InvalidTransition {
        id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
    },
    #[error("检查点与输入不匹配: {0}")]
    IncompatibleSnapshot(String),
}

/// 对单条记录的状态转换请求
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Pending -> InFlight
    Dispatch,
    /// InFlight -> Completed
    Complete { label: Label, attempts_made: u32 },
    /// InFlight -> FailedTerminal，写入兜底标签
    Fail { attempts_made: u32 },
}

/// `apply` 的实际效果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEffect {
    Applied,
    /// 记录已是终态，迟到的写回被忽略
    Stale,
}

/// 各状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    /// 标签为兜底值的终态记录数（含失败记录）
    pub unclassified: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.completed + self.failed
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }

    fn bump(&mut self, status: RecordStatus, delta: isize) {
        let slot = match status {
            RecordStatus::Pending => &mut self.pending,
            RecordStatus::InFlight => &mut self.in_flight,
            RecordStatus::Completed => &mut self.completed,
            RecordStatus::FailedTerminal => &mut self.failed,
        };
        *slot = slot.saturating_add_signed(delta);
    }
}

/// 从检查点恢复时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub restored_terminal: usize,
    pub reset_in_flight: usize,
}

/// 检查点中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub fields: Vec<String>,
    pub status: RecordStatus,
    pub label: Option<Label>,
    pub attempts: u32,
}

/// 检查点内容：原始表头 + 每行状态
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub headers: Vec<String>,
    pub rows: Vec<SnapshotRow>,
}

impl CheckpointSnapshot {
    /// 按当前分类体系复核已完成行的标签，不在体系内的行去掉标签（恢复时退回待处理）。
    /// 返回被退回的行数。
    pub fn revalidate_labels(&mut self, taxonomy: &Taxonomy) -> usize {
        let mut reset = 0;
        for row in self
            .rows
            .iter_mut()
            .filter(|row| row.status == RecordStatus::Completed)
        {
            match row.label.as_ref().and_then(|label| taxonomy.canonical(label)) {
                Some(label) => row.label = Some(label),
                None => {
                    if row.label.take().is_some() {
                        reset += 1;
                    }
                }
            }
        }
        reset
    }
}

/// 表格结构：输入表头、文本列位置、追加列名与分隔符
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub headers: Vec<String>,
    pub text_index: usize,
    pub columns: OutputColumnsConfig,
    pub delimiter: u8,
}

impl TableLayout {
    /// 输出/检查点使用的完整表头
    pub fn output_headers(&self) -> Vec<String> {
        let mut headers = self.headers.clone();
        headers.extend(self.columns.names().iter().map(|s| s.to_string()));
        headers
    }

    /// 以输出格式写出记录
    pub fn write_records<'a, W, I>(&self, writer: W, records: I) -> csv::Result<()>
    where
        W: io::Write,
        I: IntoIterator<Item = &'a Record>,
    {
        let mut out = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(writer);
        out.write_record(self.output_headers())?;
        for record in records {
            let (category, subcategory) = match record.label.as_ref() {
                Some(label) => (label.category(), label.subcategory().unwrap_or("")),
                None => ("", ""),
            };
            let attempts = record.attempts.to_string();
            out.write_record(
                record
                    .fields
                    .iter()
                    .map(String::as_str)
                    .chain([category, subcategory, record.status.as_str(), attempts.as_str()]),
            )?;
        }
        out.flush()?;
        Ok(())
    }
}

/// 加载参数
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub text_column: String,
    pub delimiter: u8,
    pub columns: OutputColumnsConfig,
}

/// 记录存储
#[derive(Debug, Clone)]
pub struct RecordStore {
    layout: TableLayout,
    records: Vec<Record>,
    counts: StatusCounts,
}

impl RecordStore {
    /// 解析带表头的分隔文本
    pub fn load<R: io::Read>(source: R, options: &LoadOptions) -> Result<Self, SchemaError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(options.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(source);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SchemaError::Malformed {
                row: 0,
                message: e.to_string(),
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(SchemaError::EmptyHeader);
        }

        let wanted = options.text_column.trim();
        let text_index = headers
            .iter()
            .position(|h| h == wanted)
            .ok_or_else(|| SchemaError::MissingColumn {
                column: wanted.to_string(),
                available: headers.join(", "),
            })?;

        if let Some(conflict) = options
            .columns
            .names()
            .iter()
            .find(|name| headers.iter().any(|h| h == *name))
        {
            return Err(SchemaError::ColumnConflict(conflict.to_string()));
        }

        let mut records = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let row = row.map_err(|e| SchemaError::Malformed {
                row: idx + 1,
                message: e.to_string(),
            })?;
            let fields: Vec<String> = row.iter().map(str::to_string).collect();
            let text = fields[text_index].clone();
            records.push(Record::new(RecordId(idx), text, fields));
        }

        let counts = StatusCounts {
            pending: records.len(),
            ..StatusCounts::default()
        };

        Ok(Self {
            layout: TableLayout {
                headers,
                text_index,
                columns: options.columns.clone(),
                delimiter: options.delimiter,
            },
            records,
            counts,
        })
    }

    /// 从文件加载
    pub fn load_path(path: &Path, options: &LoadOptions) -> Result<Self, SchemaError> {
        let file = std::fs::File::open(path)?;
        Self::load(io::BufReader::new(file), options)
    }

    /// 唯一的修改入口
    pub fn apply(&mut self, id: RecordId, transition: Transition) -> Result<ApplyEffect, StoreError> {
        let record = self
            .records
            .get_mut(id.0)
            .ok_or(StoreError::UnknownId(id))?;
        let from = record.status;

        let (to, label, attempts_made) = match transition {
            Transition::Dispatch => {
                if from != RecordStatus::Pending {
                    return Err(StoreError::InvalidTransition {
                        id,
                        from,
                        to: RecordStatus::InFlight,
                    });
                }
                record.status = RecordStatus::InFlight;
                self.counts.bump(from, -1);
                self.counts.bump(RecordStatus::InFlight, 1);
                return Ok(ApplyEffect::Applied);
            }
            Transition::Complete {
                label,
                attempts_made,
            } => (RecordStatus::Completed, label, attempts_made),
            Transition::Fail { attempts_made } => {
                (RecordStatus::FailedTerminal, Label::Unclassified, attempts_made)
            }
        };

        match from {
            RecordStatus::InFlight => {
                if label.is_unclassified() {
                    self.counts.unclassified += 1;
                }
                record.status = to;
                record.label = Some(label);
                record.attempts = record.attempts.saturating_add(attempts_made);
                self.counts.bump(from, -1);
                self.counts.bump(to, 1);
                Ok(ApplyEffect::Applied)
            }
            s if s.is_terminal() => Ok(ApplyEffect::Stale),
            _ => Err(StoreError::InvalidTransition { id, from, to }),
        }
    }

    /// 所有非终态记录，按id升序
    pub fn pending_ids(&self) -> Vec<RecordId> {
        self.records
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id)
            .collect()
    }

    /// 用兼容的检查点恢复终态记录，InFlight 一律视为 Pending
    pub fn seed_from_checkpoint(
        &mut self,
        snapshot: &CheckpointSnapshot,
    ) -> Result<SeedSummary, StoreError> {
        if snapshot.headers != self.layout.headers {
            return Err(StoreError::IncompatibleSnapshot(format!(
                "表头不一致: 检查点 [{}] / 输入 [{}]",
                snapshot.headers.join(", "),
                self.layout.headers.join(", ")
            )));
        }
        if snapshot.rows.len() != self.records.len() {
            return Err(StoreError::IncompatibleSnapshot(format!(
                "行数不一致: 检查点 {} / 输入 {}",
                snapshot.rows.len(),
                self.records.len()
            )));
        }
        if let Some((idx, _)) = snapshot
            .rows
            .iter()
            .zip(&self.records)
            .enumerate()
            .find(|(_, (row, record))| row.fields != record.fields)
        {
            return Err(StoreError::IncompatibleSnapshot(format!(
                "第 {} 行内容与输入不一致",
                idx + 1
            )));
        }

        let mut summary = SeedSummary::default();
        let mut counts = StatusCounts::default();
        for (row, record) in snapshot.rows.iter().zip(self.records.iter_mut()) {
            record.attempts = record.attempts.max(row.attempts);
            match (row.status, row.label.as_ref()) {
                (RecordStatus::Completed, Some(label)) => {
                    record.status = RecordStatus::Completed;
                    record.label = Some(label.clone());
                    summary.restored_terminal += 1;
                }
                (RecordStatus::FailedTerminal, _) => {
                    record.status = RecordStatus::FailedTerminal;
                    record.label = Some(Label::Unclassified);
                    summary.restored_terminal += 1;
                }
                (RecordStatus::InFlight, _) => {
                    record.status = RecordStatus::Pending;
                    record.label = None;
                    summary.reset_in_flight += 1;
                }
                _ => {
                    record.status = RecordStatus::Pending;
                    record.label = None;
                }
            }
            counts.bump(record.status, 1);
            if record.label.as_ref().is_some_and(Label::is_unclassified) {
                counts.unclassified += 1;
            }
        }
        self.counts = counts;
        Ok(summary)
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(id.0)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.counts.terminal() == self.records.len()
    }

    /// 写出完整表格
    pub fn write_to<W: io::Write>(&self, writer: W) -> csv::Result<()> {
        self.layout.write_records(writer, &self.records)
    }
}

/// 记录存储的共享句柄
///
/// 写锁只对流水线内部开放，合并器是唯一的写入方。
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<RecordStore>>,
}

impl StoreHandle {
    pub fn new(store: RecordStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RecordStore> {
        self.inner.read()
    }

    pub(in crate::pipeline) fn write(&self) -> RwLockWriteGuard<'_, RecordStore> {
        self.inner.write()
    }
}
