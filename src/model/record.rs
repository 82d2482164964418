use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::taxonomy::Label;

/// 记录标识：数据行在输入中的位置（从0开始），加载后不再变化
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub usize);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 记录处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InFlight,
    Completed,
    FailedTerminal,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InFlight => "in_flight",
            RecordStatus::Completed => "completed",
            RecordStatus::FailedTerminal => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::FailedTerminal)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Ok(RecordStatus::Pending),
            "in_flight" | "inflight" => Ok(RecordStatus::InFlight),
            "completed" => Ok(RecordStatus::Completed),
            "failed" | "failed_terminal" => Ok(RecordStatus::FailedTerminal),
            _ => Err(()),
        }
    }
}

/// 单条输入记录及其当前分类结果
///
/// 字段只能通过 `RecordStore::apply` 修改。
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub(crate) id: RecordId,
    pub(crate) text: String,
    pub(crate) fields: Vec<String>,
    pub(crate) status: RecordStatus,
    pub(crate) label: Option<Label>,
    pub(crate) attempts: u32,
}

impl Record {
    pub(crate) fn new(id: RecordId, text: String, fields: Vec<String>) -> Self {
        Self {
            id,
            text,
            fields,
            status: RecordStatus::Pending,
            label: None,
            attempts: 0,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 原始行的所有列（透传到输出）
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
