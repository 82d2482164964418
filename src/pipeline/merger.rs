//! 结果合并器
//!
//! 记录存储唯一的写入方，运行在调度协程内。派发前把记录标记为 InFlight，
//! 工作协程返回结果后写入终态，并在每次写入后询问检查点管理器。

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointManager;
use super::retry::Outcome;
use super::store::{ApplyEffect, StoreError, StoreHandle, Transition};
use crate::model::RecordId;
use crate::util::logging::standards::events;

/// 工作协程交回的结果
///
/// 并发许可随结果一起送回，合并完成后才释放，保证 InFlight 数不超过并发上限。
#[derive(Debug)]
pub struct Completion {
    pub id: RecordId,
    pub outcome: Outcome,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl Completion {
    pub fn new(id: RecordId, outcome: Outcome) -> Self {
        Self {
            id,
            outcome,
            permit: None,
        }
    }

    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

/// 合并统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale: usize,
    pub checkpoints: usize,
}

pub struct ResultMerger {
    store: StoreHandle,
    checkpoint: CheckpointManager,
    stats: MergeStats,
}

impl ResultMerger {
    pub fn new(store: StoreHandle, checkpoint: CheckpointManager) -> Self {
        Self {
            store,
            checkpoint,
            stats: MergeStats::default(),
        }
    }

    /// Pending -> InFlight，返回记录文本供工作协程使用
    pub fn dispatch(&mut self, id: RecordId) -> Result<String, StoreError> {
        let mut store = self.store.write();
        store.apply(id, Transition::Dispatch)?;
        self.stats.dispatched += 1;
        let text = store
            .get(id)
            .map(|r| r.text().to_string())
            .ok_or(StoreError::UnknownId(id))?;
        debug!(event = events::RECORD_DISPATCH, record = %id, "记录已派发");
        Ok(text)
    }

    /// 写入工作协程的结果
    pub async fn merge(&mut self, completion: Completion) -> Result<ApplyEffect, StoreError> {
        let Completion { id, outcome, permit } = completion;

        let transition = match &outcome {
            Outcome::Success { label, attempts } => Transition::Complete {
                label: label.clone(),
                attempts_made: *attempts,
            },
            Outcome::Exhausted { attempts, .. } => Transition::Fail {
                attempts_made: *attempts,
            },
        };

        let effect = self.store.write().apply(id, transition)?;
        drop(permit);

        match (&outcome, effect) {
            (_, ApplyEffect::Stale) => {
                self.stats.stale += 1;
                warn!(event = events::RECORD_STALE, record = %id, "记录已是终态，忽略迟到的结果");
                return Ok(effect);
            }
            (Outcome::Success { label, attempts }, ApplyEffect::Applied) => {
                self.stats.completed += 1;
                let event = if label.is_unclassified() {
                    events::RECORD_UNCLASSIFIED
                } else {
                    events::RECORD_COMPLETE
                };
                debug!(event, record = %id, label = %label, attempts, "记录分类完成");
            }
            (
                Outcome::Exhausted {
                    last_error,
                    attempts,
                },
                ApplyEffect::Applied,
            ) => {
                self.stats.failed += 1;
                warn!(
                    event = events::RECORD_FAILED,
                    record = %id,
                    attempts,
                    error_kind = last_error.kind(),
                    error = %last_error,
                    "记录分类失败，写入兜底标签"
                );
            }
        }

        if self.checkpoint.maybe_checkpoint(&self.store).await {
            self.stats.checkpoints += 1;
            let (terminal, total) = {
                let store = self.store.read();
                (store.counts().terminal(), store.len())
            };
            info!(event = events::CHECKPOINT_WRITE, terminal, total, "检查点已更新");
        }
        Ok(effect)
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn into_checkpoint(self) -> CheckpointManager {
        self.checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Label, RecordStatus};
    use crate::pipeline::client::ClientError;
    use crate::pipeline::store::tests::{options, sample_csv};
    use crate::pipeline::store::RecordStore;
    use crate::util::config::types::CheckpointConfig;
    use tempfile::TempDir;

    fn merger(rows: usize, dir: &TempDir) -> (StoreHandle, ResultMerger) {
        let store =
            StoreHandle::new(RecordStore::load(sample_csv(rows).as_bytes(), &options("Speciality")).unwrap());
        let checkpoint = CheckpointManager::new(
            dir.path().join("cp.csv"),
            &CheckpointConfig::default(),
            rows,
        );
        (store.clone(), ResultMerger::new(store, checkpoint))
    }

    #[tokio::test]
    async fn test_dispatch_then_merge() {
        let dir = TempDir::new().unwrap();
        let (store, mut merger) = merger(2, &dir);

        assert_eq!(merger.dispatch(RecordId(0)).unwrap(), "major 0");
        assert_eq!(store.read().counts().in_flight, 1);
        // 同一条记录不能被派发两次
        assert!(merger.dispatch(RecordId(0)).is_err());

        let effect = merger
            .merge(Completion::new(
                RecordId(0),
                Outcome::Success {
                    label: Label::classified("Arts", None),
                    attempts: 1,
                },
            ))
            .await
            .unwrap();
        assert_eq!(effect, ApplyEffect::Applied);
        assert_eq!(
            store.read().get(RecordId(0)).unwrap().status(),
            RecordStatus::Completed
        );

        merger.dispatch(RecordId(1)).unwrap();
        merger
            .merge(Completion::new(
                RecordId(1),
                Outcome::Exhausted {
                    last_error: ClientError::Timeout,
                    attempts: 3,
                },
            ))
            .await
            .unwrap();

        let stats = merger.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        // 阈值为 1 条（2条的10%向上取整），两次写入都触发检查点
        assert_eq!(stats.checkpoints, 2);
        assert!(dir.path().join("cp.csv").exists());
    }

    #[tokio::test]
    async fn test_late_result_is_stale() {
        let dir = TempDir::new().unwrap();
        let (store, mut merger) = merger(1, &dir);
        merger.dispatch(RecordId(0)).unwrap();
        let success = Outcome::Success {
            label: Label::Unclassified,
            attempts: 1,
        };
        merger
            .merge(Completion::new(RecordId(0), success.clone()))
            .await
            .unwrap();
        assert_eq!(
            merger.merge(Completion::new(RecordId(0), success)).await.unwrap(),
            ApplyEffect::Stale
        );
        assert_eq!(merger.stats().stale, 1);
        assert_eq!(store.read().get(RecordId(0)).unwrap().attempts(), 1);
    }
}
