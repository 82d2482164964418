//! 调度器
//!
//! 在协调协程中循环：有空闲许可且未取消时派发下一条待处理记录，
//! 工作协程的结果经 mpsc 通道送回并交给合并器。取消后不再派发，
//! 等待已派发的记录全部合并后返回。分类过程异常退出的记录按失败处理，
//! 每条已派发的记录都会送回一个结果。

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::client::ClientError;
use super::merger::{Completion, ResultMerger};
use super::retry::Outcome;
use super::store::StoreError;
use super::PipelineContext;
use crate::util::logging::standards::events;

/// 一轮调度的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub merged: usize,
    pub cancelled: bool,
}

pub async fn run(
    ctx: &PipelineContext,
    merger: &mut ResultMerger,
    cancel: &CancellationToken,
) -> Result<DispatchReport, StoreError> {
    let concurrency = ctx.concurrency.max(1);
    let mut queue = ctx.store.read().pending_ids().into_iter().peekable();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel::<Completion>(concurrency);

    let mut report = DispatchReport::default();
    let mut in_flight = 0usize;

    debug!(
        pending = queue.len(),
        concurrency,
        "开始调度"
    );

    loop {
        let can_dispatch = !report.cancelled && queue.peek().is_some();
        if in_flight == 0 && !can_dispatch {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !report.cancelled => {
                report.cancelled = true;
                info!(
                    event = events::JOB_CANCELLED,
                    in_flight,
                    remaining = queue.len(),
                    "收到停止信号，等待处理中的记录完成"
                );
            }

            Some(completion) = rx.recv(), if in_flight > 0 => {
                in_flight -= 1;
                report.merged += 1;
                merger.merge(completion).await?;
            }

            permit = semaphore.clone().acquire_owned(), if can_dispatch => {
                let Ok(permit) = permit else { break };
                let Some(id) = queue.next() else { continue };
                let text = merger.dispatch(id)?;
                in_flight += 1;
                report.dispatched += 1;

                let client = ctx.client.clone();
                let retry = ctx.retry.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let attempt = tokio::spawn(async move { retry.attempt(&client, id, &text).await });
                    let outcome = match attempt.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(
                                event = events::RECORD_FAILED,
                                record = %id,
                                error = %e,
                                "分类任务异常退出"
                            );
                            Outcome::Exhausted {
                                last_error: ClientError::Unavailable(format!("分类任务异常退出: {}", e)),
                                attempts: 1,
                            }
                        }
                    };
                    let _ = tx.send(Completion::new(id, outcome).with_permit(permit)).await;
                });
            }

            else => break,
        }
    }

    Ok(report)
}
