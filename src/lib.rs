//! 可恢复的并发记录分类
//!
//! 读取带表头的分隔文本，逐行调用外部分类服务，把结果映射到配置的分类体系，
//! 并定期写入检查点，中断后可从检查点继续。

pub mod build_info;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod util;

pub use model::{Label, Record, RecordId, RecordStatus, Taxonomy};
pub use pipeline::{Pipeline, PipelineContext, RunSummary};
pub use util::config::Config;
