//! 分类流水线
//!
//! - store: 记录存储与状态机
//! - client: 分类客户端与外部服务抽象
//! - retry: 重试与退避
//! - merger: 结果合并（唯一写入方）
//! - scheduler: 有界并发调度
//! - checkpoint: 检查点读写
//! - progress: 进度与部分结果

pub mod checkpoint;
pub mod client;
pub mod merger;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use client::{ClassificationClient, ClientError, Oracle};
pub use merger::{Completion, ResultMerger};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use retry::{Outcome, RetryPolicy};
pub use store::{LoadOptions, RecordStore, SchemaError, StoreError, StoreHandle};

use crate::model::Taxonomy;
use crate::util::config::Config;
use crate::util::logging::standards::events;

/// 流水线各组件共享的显式上下文
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub store: StoreHandle,
    pub client: ClassificationClient,
    pub retry: RetryPolicy,
    pub concurrency: usize,
}

/// 一次运行的汇总
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub unclassified: usize,
    /// 从检查点恢复的终态记录数
    pub resumed: usize,
    pub dispatched: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub distribution: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.completed + self.failed == self.total
    }
}

pub struct Pipeline {
    ctx: PipelineContext,
    checkpoint: CheckpointManager,
    output_path: Option<PathBuf>,
    progress_interval: Duration,
    resumed: usize,
    /// 是否已从检查点恢复；否则启动时先写一份初始检查点
    seeded: bool,
}

impl Pipeline {
    pub fn new(
        ctx: PipelineContext,
        checkpoint: CheckpointManager,
        output_path: Option<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            checkpoint,
            output_path,
            progress_interval: Duration::from_secs(15),
            resumed: 0,
            seeded: false,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// 按配置装配：读取输入、校验分类体系、尝试从检查点恢复
    pub fn from_config(config: &Config, oracle: Arc<dyn Oracle>) -> Result<Self> {
        let taxonomy = Taxonomy::from_config(&config.taxonomy).context("分类体系配置无效")?;
        let store = load_store(config)?;
        let total = store.len();

        let client = ClassificationClient::new(
            oracle,
            Arc::new(taxonomy),
            config.pipeline.request_timeout(),
        );
        let ctx = PipelineContext {
            store: StoreHandle::new(store),
            client,
            retry: RetryPolicy::from_config(&config.pipeline),
            concurrency: config.pipeline.concurrency,
        };
        let checkpoint = CheckpointManager::new(
            config.job.checkpoint_path(),
            &config.checkpoint,
            total,
        );

        let mut pipeline = Self::new(ctx, checkpoint, Some(config.job.output_path.clone()))
            .with_progress_interval(Duration::from_secs(config.progress.log_interval_secs));
        pipeline.resume();
        Ok(pipeline)
    }

    /// 读取检查点并恢复终态记录；不兼容或无法读取时按全新任务处理
    pub fn resume(&mut self) -> usize {
        let (delimiter, columns) = {
            let store = self.ctx.store.read();
            let layout = store.layout();
            (layout.delimiter, layout.columns.clone())
        };
        let Some(mut snapshot) = self.checkpoint.load_checkpoint(delimiter, &columns) else {
            return 0;
        };
        let relabelled = snapshot.revalidate_labels(self.ctx.client.taxonomy());

        let mut store = self.ctx.store.write();
        match store.seed_from_checkpoint(&snapshot) {
            Ok(summary) => {
                self.checkpoint.set_baseline(&store);
                self.resumed = summary.restored_terminal;
                self.seeded = true;
                info!(
                    event = events::JOB_RESUME,
                    restored = summary.restored_terminal,
                    reset_in_flight = summary.reset_in_flight,
                    relabelled,
                    remaining = store.counts().pending,
                    "已从检查点恢复"
                );
                summary.restored_terminal
            }
            Err(e) => {
                warn!(
                    event = events::CHECKPOINT_IGNORED,
                    path = %self.checkpoint.path().display(),
                    error = %e,
                    "检查点与输入不一致，忽略检查点"
                );
                0
            }
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn progress(&self) -> ProgressReporter {
        ProgressReporter::new(self.ctx.store.clone())
    }

    /// 运行到全部记录进入终态，或收到停止信号
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();
        let Self {
            ctx,
            mut checkpoint,
            output_path,
            progress_interval,
            resumed,
            seeded,
        } = self;

        let total = ctx.store.read().len();
        info!(
            event = events::JOB_START,
            total,
            resumed,
            concurrency = ctx.concurrency,
            max_attempts = ctx.retry.max_attempts(),
            "开始分类任务"
        );

        if !seeded {
            match checkpoint.flush(&ctx.store).await {
                Ok(()) => debug!(
                    event = events::CHECKPOINT_WRITE,
                    path = %checkpoint.path().display(),
                    "已创建初始检查点"
                ),
                Err(e) => warn!(
                    event = events::CHECKPOINT_WRITE_FAILED,
                    path = %checkpoint.path().display(),
                    error = %e,
                    "创建初始检查点失败"
                ),
            }
        }

        let reporter = ProgressReporter::new(ctx.store.clone());
        let logger_stop = cancel.child_token();
        let logger = progress::spawn_progress_logger(
            reporter.clone(),
            progress_interval,
            logger_stop.clone(),
        );

        let mut merger = ResultMerger::new(ctx.store.clone(), checkpoint);
        let dispatch = scheduler::run(&ctx, &mut merger, &cancel).await;
        logger_stop.cancel();
        let _ = logger.await;

        let stats = merger.stats();
        let mut checkpoint = merger.into_checkpoint();
        let report = match dispatch {
            Ok(report) => report,
            Err(e) => {
                error!(event = events::JOB_ERROR, error = %e, "调度失败");
                if let Err(flush_err) = checkpoint.flush(&ctx.store).await {
                    warn!(error = %flush_err, "写入检查点失败");
                }
                return Err(e).context("记录状态转换失败");
            }
        };

        let finished = ctx.store.read().is_finished();
        if !finished {
            if let Err(e) = checkpoint.flush(&ctx.store).await {
                warn!(event = events::CHECKPOINT_WRITE_FAILED, error = %e, "取消时写入检查点失败");
            }
        } else if let Some(path) = output_path.as_ref() {
            checkpoint::persist_table(path, &ctx.store)
                .await
                .with_context(|| format!("写入输出文件失败: {}", path.display()))?;
            info!(event = events::OUTPUT_WRITE, path = %path.display(), rows = total, "输出已写入");
            checkpoint.remove();
        } else {
            checkpoint.remove();
        }

        let counts = ctx.store.read().counts();
        let summary = RunSummary {
            total,
            completed: counts.completed,
            failed: counts.failed,
            unclassified: counts.unclassified,
            resumed,
            dispatched: stats.dispatched,
            cancelled: report.cancelled && !finished,
            elapsed: started.elapsed(),
            distribution: reporter.label_distribution(),
        };

        let event = if summary.cancelled {
            events::JOB_CANCELLED
        } else {
            events::JOB_COMPLETE
        };
        info!(
            event,
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            unclassified = summary.unclassified,
            resumed = summary.resumed,
            dispatched = summary.dispatched,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "分类任务结束"
        );
        Ok(summary)
    }
}

/// 按配置读取输入文件
pub fn load_store(config: &Config) -> Result<RecordStore> {
    let options = LoadOptions {
        text_column: config.job.text_column.clone(),
        delimiter: config.job.delimiter_byte(),
        columns: config.output.clone(),
    };
    RecordStore::load_path(&config.job.input_path, &options)
        .with_context(|| format!("读取输入文件失败: {}", config.job.input_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Label, RecordId, RecordStatus};
    use crate::pipeline::client::tests::taxonomy;
    use crate::pipeline::store::tests::{options, sample_csv};
    use crate::util::config::types::CheckpointConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 可编排的外部服务：按文本记录调用次数
    #[derive(Default)]
    struct ScriptedOracle {
        /// 文本 -> 前几次调用失败
        fail_first: HashMap<String, u32>,
        always_fail: Vec<String>,
        answer: Option<String>,
        delay: Duration,
        calls: Mutex<HashMap<String, u32>>,
        current: AtomicUsize,
        peak: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
        total_calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn calls_for(&self, text: &str) -> u32 {
            self.calls.lock().get(text).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn ask(&self, text: &str) -> Result<String, ClientError> {
            let n = {
                let mut calls = self.calls.lock();
                let n = calls.entry(text.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let total = self.total_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = &self.cancel_after {
                if total >= *after {
                    token.cancel();
                }
            }

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.always_fail.iter().any(|t| t == text) {
                return Err(ClientError::Unavailable("scripted outage".to_string()));
            }
            if self.fail_first.get(text).is_some_and(|&k| n <= k) {
                return Err(ClientError::RateLimited { retry_after: None });
            }
            Ok(self
                .answer
                .clone()
                .unwrap_or_else(|| "Engineering / Civil".to_string()))
        }
    }

    fn build(
        rows: usize,
        oracle: Arc<dyn Oracle>,
        concurrency: usize,
        max_retries: u32,
        dir: &Path,
    ) -> Pipeline {
        let store = RecordStore::load(sample_csv(rows).as_bytes(), &options("Speciality")).unwrap();
        let ctx = PipelineContext {
            store: StoreHandle::new(store),
            client: ClassificationClient::new(oracle, taxonomy(), Duration::from_secs(5)),
            retry: RetryPolicy::new(max_retries, Duration::from_millis(10), Duration::from_millis(100), 4),
            concurrency,
        };
        let checkpoint = CheckpointManager::new(
            dir.join("out.checkpoint.csv"),
            &CheckpointConfig {
                enabled: true,
                every_percent: 10.0,
                every_records: Some(2),
            },
            rows,
        );
        Pipeline::new(ctx, checkpoint, Some(dir.join("out.csv")))
            .with_progress_interval(Duration::from_secs(3600))
    }

    /// 指定文本触发 panic，其余正常作答
    struct PanickyOracle {
        poisoned: String,
    }

    #[async_trait]
    impl Oracle for PanickyOracle {
        async fn ask(&self, text: &str) -> Result<String, ClientError> {
            if text == self.poisoned {
                panic!("oracle bug on {}", text);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok("Arts / Music".to_string())
        }
    }

    /// 每次调用时记录检查点文件是否存在
    struct CheckpointWatcher {
        path: PathBuf,
        seen: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Oracle for CheckpointWatcher {
        async fn ask(&self, _text: &str) -> Result<String, ClientError> {
            self.seen.lock().push(self.path.exists());
            Ok("Engineering / Civil".to_string())
        }
    }

    fn attempts(store: &StoreHandle) -> Vec<u32> {
        store.read().records().iter().map(|r| r.attempts()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_once() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle {
            fail_first: HashMap::from([("major 4".to_string(), 1), ("major 9".to_string(), 1)]),
            ..Default::default()
        });
        let pipeline = build(12, oracle.clone(), 3, 2, dir.path());
        let store = pipeline.context().store.clone();

        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.completed, 12);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.dispatched, 12);

        let expected: Vec<u32> = (0..12).map(|i| if i == 4 || i == 9 { 2 } else { 1 }).collect();
        assert_eq!(attempts(&store), expected);
        for record in store.read().records() {
            assert_eq!(record.status(), RecordStatus::Completed);
            assert_eq!(oracle.calls_for(record.text()), record.attempts());
        }

        // 完成后写出输出并删除检查点
        assert!(dir.path().join("out.csv").exists());
        assert!(!dir.path().join("out.checkpoint.csv").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_answers_complete_as_unclassified() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle {
            answer: Some("no idea, sorry".to_string()),
            ..Default::default()
        });
        let pipeline = build(5, oracle, 2, 3, dir.path());
        let store = pipeline.context().store.clone();
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.completed, 5);
        assert_eq!(summary.unclassified, 5);
        assert_eq!(summary.distribution.get("Unclassified"), Some(&5));
        for record in store.read().records() {
            assert_eq!(record.status(), RecordStatus::Completed);
            assert_eq!(record.label(), Some(&Label::Unclassified));
            assert_eq!(record.attempts(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_record_is_bounded() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle {
            always_fail: vec!["major 2".to_string()],
            ..Default::default()
        });
        let pipeline = build(4, oracle.clone(), 2, 3, dir.path());
        let store = pipeline.context().store.clone();
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 3);
        let guard = store.read();
        let failed = guard.get(RecordId(2)).unwrap();
        assert_eq!(failed.status(), RecordStatus::FailedTerminal);
        assert_eq!(failed.label(), Some(&Label::Unclassified));
        assert_eq!(failed.attempts(), 3);
        assert_eq!(oracle.calls_for("major 2"), 3);

        let output = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
        assert!(output.contains("student2,major 2,Unclassified,,failed,3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let pipeline = build(12, oracle.clone(), 3, 1, dir.path());
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.completed, 12);
        assert_eq!(oracle.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_resume_finishes_remaining() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let first = Arc::new(ScriptedOracle {
            delay: Duration::from_millis(5),
            cancel_after: Some((4, cancel.clone())),
            ..Default::default()
        });
        let pipeline = build(12, first.clone(), 2, 1, dir.path());
        let store = pipeline.context().store.clone();
        let summary = pipeline.run(cancel).await.unwrap();

        assert!(summary.cancelled);
        assert!(!summary.is_complete());
        let done = summary.completed + summary.failed;
        // 已派发的记录全部合并，没有残留的 InFlight
        assert_eq!(done, summary.dispatched);
        assert!(done >= 4 && done < 12);
        assert_eq!(store.read().counts().in_flight, 0);
        assert!(dir.path().join("out.checkpoint.csv").exists());
        assert!(!dir.path().join("out.csv").exists());

        // 重启后只处理剩余记录
        let second = Arc::new(ScriptedOracle::default());
        let mut pipeline = build(12, second.clone(), 2, 1, dir.path());
        assert_eq!(pipeline.resume(), done);
        let store = pipeline.context().store.clone();
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.resumed, done);
        assert_eq!(summary.dispatched, 12 - done);
        assert_eq!(second.total_calls.load(Ordering::SeqCst), 12 - done);
        for record in store.read().records() {
            assert_eq!(record.label(), Some(&Label::classified("Engineering", Some("Civil"))));
            assert_eq!(record.attempts(), 1);
        }
        assert!(!dir.path().join("out.checkpoint.csv").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_checkpoint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("out.checkpoint.csv"),
            "Other,Speciality,Classified Field,Classified Major,Classification Status,Classification Attempts\n\
             a,major 0,Arts,Music,completed,1\n",
        )
        .unwrap();
        let oracle = Arc::new(ScriptedOracle::default());
        let mut pipeline = build(3, oracle.clone(), 2, 1, dir.path());
        assert_eq!(pipeline.resume(), 0);
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.dispatched, 3);
        assert_eq!(oracle.total_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_input_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let pipeline = build(0, Arc::new(ScriptedOracle::default()), 2, 1, dir.path());
        assert_eq!(pipeline.progress().completion_ratio(), 1.0);
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.total, 0);
        assert!(dir.path().join("out.csv").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_fails_only_its_record() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(PanickyOracle {
            poisoned: "major 1".to_string(),
        });
        let pipeline = build(3, oracle, 2, 3, dir.path());
        let store = pipeline.context().store.clone();

        let summary = tokio::time::timeout(
            Duration::from_secs(30),
            pipeline.run(CancellationToken::new()),
        )
        .await
        .expect("run must not hang after a worker panic")
        .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        let guard = store.read();
        assert_eq!(guard.counts().in_flight, 0);
        let failed = guard.get(RecordId(1)).unwrap();
        assert_eq!(failed.status(), RecordStatus::FailedTerminal);
        assert_eq!(failed.label(), Some(&Label::Unclassified));
        assert_eq!(failed.attempts(), 1);

        let output = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
        assert!(output.contains("student1,major 1,Unclassified,,failed,1"));
        assert!(output.contains("student2,major 2,Arts,Music,completed,1"));
    }

    #[tokio::test]
    async fn test_fresh_run_writes_initial_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.checkpoint.csv");
        let oracle = Arc::new(CheckpointWatcher {
            path: path.clone(),
            seen: Mutex::new(Vec::new()),
        });
        // 并发 1、阈值 2：第一次调用前还没有任何记录完成
        let pipeline = build(3, oracle.clone(), 1, 1, dir.path());
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(oracle.seen.lock().first(), Some(&true));
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_reclassifies_labels_outside_taxonomy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("out.checkpoint.csv"),
            "Name,Speciality,Classified Field,Classified Major,Classification Status,Classification Attempts\n\
             student0,major 0,Arts,Music,completed,1\n\
             student1,major 1,Space,Rockets,completed,1\n\
             student2,major 2,,,pending,0\n",
        )
        .unwrap();
        let oracle = Arc::new(ScriptedOracle::default());
        let mut pipeline = build(3, oracle.clone(), 2, 1, dir.path());
        assert_eq!(pipeline.resume(), 1);
        let store = pipeline.context().store.clone();

        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.dispatched, 2);
        assert_eq!(oracle.calls_for("major 0"), 0);
        assert_eq!(oracle.calls_for("major 1"), 1);

        let guard = store.read();
        assert_eq!(
            guard.get(RecordId(0)).unwrap().label(),
            Some(&Label::classified("Arts", Some("Music")))
        );
        let relabelled = guard.get(RecordId(1)).unwrap();
        assert_eq!(
            relabelled.label(),
            Some(&Label::classified("Engineering", Some("Civil")))
        );
        assert_eq!(relabelled.attempts(), 2);
    }
}
