//! Centralised logging metadata (event names, shared keys, etc.).

/// Canonical event names used across the classifier.
pub mod events {
    /// Job lifecycle.
    pub const JOB_START: &str = "job.start";
    pub const JOB_RESUME: &str = "job.resume";
    pub const JOB_COMPLETE: &str = "job.complete";
    pub const JOB_CANCELLED: &str = "job.cancelled";
    pub const JOB_ERROR: &str = "job.error";

    /// Per-record processing.
    pub const RECORD_DISPATCH: &str = "record.dispatch";
    pub const RECORD_RETRY: &str = "record.retry";
    pub const RECORD_COMPLETE: &str = "record.complete";
    pub const RECORD_UNCLASSIFIED: &str = "record.unclassified";
    pub const RECORD_FAILED: &str = "record.failed";
    pub const RECORD_STALE: &str = "record.stale";

    /// Oracle calls.
    pub const ORACLE_REQUEST: &str = "oracle.request";
    pub const ORACLE_ERROR: &str = "oracle.error";

    /// 检查点。
    pub const CHECKPOINT_LOAD: &str = "checkpoint.load";
    pub const CHECKPOINT_IGNORED: &str = "checkpoint.ignored";
    pub const CHECKPOINT_WRITE: &str = "checkpoint.write";
    pub const CHECKPOINT_WRITE_FAILED: &str = "checkpoint.write_failed";
    pub const CHECKPOINT_REMOVE: &str = "checkpoint.remove";

    /// Progress and output.
    pub const PROGRESS: &str = "progress.tick";
    pub const OUTPUT_WRITE: &str = "output.write";
}
