//! 进度报告
//!
//! 只读投影：每次调用只持有短暂的读锁，不会阻塞工作协程。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::checkpoint::{persist_table, CheckpointError};
use super::store::{RecordStore, StoreHandle};
use crate::model::Record;
use crate::util::logging::standards::events;

/// 某一时刻的进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub unclassified: usize,
    pub percent: f64,
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    store: StoreHandle,
}

impl ProgressReporter {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// 终态数 / 总数；没有记录时视为已完成
    pub fn completion_ratio(&self) -> f64 {
        ratio(&self.store.read())
    }

    pub fn percent_complete(&self) -> f64 {
        self.completion_ratio() * 100.0
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let store = self.store.read();
        let counts = store.counts();
        ProgressSnapshot {
            total: counts.total(),
            pending: counts.pending,
            in_flight: counts.in_flight,
            completed: counts.completed,
            failed: counts.failed,
            unclassified: counts.unclassified,
            percent: ratio(&store) * 100.0,
        }
    }

    /// 按id排序的记录副本
    pub fn partial_extract(&self) -> Vec<Record> {
        self.store.read().records().to_vec()
    }

    /// 以输出格式写出当前的部分结果
    pub async fn write_partial(&self, path: &Path) -> Result<(), CheckpointError> {
        persist_table(path, &self.store).await
    }

    /// 终态记录的标签分布，键为 `类别 / 二级类别`
    pub fn label_distribution(&self) -> BTreeMap<String, usize> {
        label_distribution(self.store.read().records())
    }
}

pub fn label_distribution(records: &[Record]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for label in records.iter().filter_map(Record::label) {
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }
    counts
}

fn ratio(store: &RecordStore) -> f64 {
    if store.is_empty() {
        return 1.0;
    }
    store.counts().terminal() as f64 / store.len() as f64
}

/// 定期输出进度日志，直到 token 被取消
pub fn spawn_progress_logger(
    reporter: ProgressReporter,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let p = reporter.snapshot();
                    info!(
                        event = events::PROGRESS,
                        percent = format!("{:.1}", p.percent),
                        completed = p.completed,
                        failed = p.failed,
                        in_flight = p.in_flight,
                        pending = p.pending,
                        total = p.total,
                        "分类进度"
                    );
                }
            }
        }
    })
}
