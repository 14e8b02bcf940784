//! 任务 worker
//!
//! 每个存活任务一个协作式 worker：循环跑迭代，收件箱空且无待重试时让出；
//! 迭代上限、回合收束、外部停止都会结束循环。退出路径（包括出错）一律
//! 收敛记录状态并广播，前提是记录里的 worker 身份仍归自己。

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::completion::notify_parent_of_completion;
use crate::engine::{IterationEngine, IterationOutcome};
use crate::error::HiveError;
use crate::model::TaskStatus;

use super::Runtime;

pub(crate) async fn run_worker(
    runtime: Arc<Runtime>,
    task_id: String,
    worker_id: u64,
    cancel: CancellationToken,
) {
    info!(task_id = %task_id, worker_id, "worker started");
    let subscriber_cancel = CancellationToken::new();
    let result = worker_loop(&runtime, &task_id, worker_id, &cancel, &subscriber_cancel).await;
    if let Err(e) = &result {
        error!(task_id = %task_id, worker_id, error = %e, "worker exited with error");
    }
    subscriber_cancel.cancel();
    cleanup(&runtime, &task_id, worker_id).await;
}

async fn worker_loop(
    runtime: &Arc<Runtime>,
    task_id: &str,
    worker_id: u64,
    cancel: &CancellationToken,
    subscriber_cancel: &CancellationToken,
) -> Result<(), HiveError> {
    let store = runtime.store();
    let record = store.require_record(task_id).await?;

    // 声明身份(与 launch 侧的写入幂等);status 留给首次迭代翻转
    store.set_worker(task_id, Some(worker_id)).await?;

    // 根任务负责全局状态清扫
    let is_root = record.parent_task_id.is_none();
    if is_root {
        runtime.reconcile_all().await?;
    }

    let gate = runtime.throttles().gate(&record.model_id).await;
    gate.spawn_subscriber(subscriber_cancel.clone());

    let engine = IterationEngine::new(Arc::clone(runtime));
    let max_iterations = record.max_iterations;
    let mut did_work = false;
    let mut retry_pending = false;

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            info!(task_id, iteration, "worker cancelled");
            break;
        }
        if is_root {
            let _ = runtime.reconcile_all().await;
        }

        let queue_len = store.queue_len(task_id).await?;
        if queue_len == 0 && !retry_pending {
            debug!(task_id, iteration, "inbox empty, yielding");
            break;
        }

        match engine
            .run_iteration(task_id, iteration, max_iterations, cancel)
            .await?
        {
            IterationOutcome::Cancelled => break,
            IterationOutcome::Throttled => {
                // 已退避,下一轮重发同一请求
                retry_pending = true;
            }
            IterationOutcome::Completed { turn_ending } => {
                retry_pending = false;
                did_work = true;
                if turn_ending && store.queue_len(task_id).await? == 0 {
                    break;
                }
            }
        }
    }

    if did_work {
        if let Err(e) = notify_parent_of_completion(runtime, task_id).await {
            warn!(task_id, error = %e, "failed to notify parent of completion");
        }
    }

    Ok(())
}

/// 退出路径收敛:仅在记录仍指向本 worker 时改写(外部 stop 可能已抢先清理)
async fn cleanup(runtime: &Arc<Runtime>, task_id: &str, worker_id: u64) {
    let store = runtime.store();
    match store.load_record(task_id).await {
        Ok(Some(record)) if record.worker_id == Some(worker_id) => {
            let _ = store.set_worker(task_id, None).await;
            let _ = store.set_status(task_id, TaskStatus::Stopped).await;
            let _ = store
                .publish_task_event(
                    task_id,
                    json!({ "type": "process_ended", "worker_id": worker_id }),
                )
                .await;
        }
        _ => {}
    }
    let _ = store.clear_api_call_marker(task_id).await;
    runtime.workers().remove(worker_id).await;
    info!(task_id, worker_id, "worker exited");
}
