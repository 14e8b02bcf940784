//! 存活探测
//!
//! 以任务记录里的 worker_id 对照注册表判定存活；发现死亡或缺失时
//! 原子收敛记录（清 worker_id、status=stopped）并广播 process_ended。
//! 探测只收敛状态，从不中断存活的 worker。

use serde_json::json;
use tracing::{debug, info};

use crate::error::HiveError;
use crate::model::TaskStatus;

use super::Runtime;

/// 探测结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskActivity {
    pub alive: bool,
    pub worker_id: Option<u64>,
}

impl TaskActivity {
    pub const DEAD: TaskActivity = TaskActivity {
        alive: false,
        worker_id: None,
    };
}

impl Runtime {
    /// 探测任务存活并收敛记录状态
    pub async fn probe(&self, task_id: &str) -> Result<TaskActivity, HiveError> {
        let Some(record) = self.store().load_record(task_id).await? else {
            return Ok(TaskActivity::DEAD);
        };

        let alive = match record.worker_id {
            None => false,
            Some(worker_id) => self.workers().is_alive(worker_id).await,
        };

        if alive {
            // 存活时不改写 status:running 由 worker 的首次迭代自己翻转,
            // 避免探测赶在首次合入前改变回合边界判定
            return Ok(TaskActivity {
                alive: true,
                worker_id: record.worker_id,
            });
        }

        // 死亡或缺失：仅在记录仍声称存活时收敛并广播
        if record.worker_id.is_some() || record.status == TaskStatus::Running {
            info!(task_id, stale_worker = ?record.worker_id, "reconciling dead worker");
            self.store().set_worker(task_id, None).await?;
            self.store().set_status(task_id, TaskStatus::Stopped).await?;
            self.store()
                .publish_task_event(task_id, json!({ "type": "process_ended" }))
                .await?;
        }
        Ok(TaskActivity::DEAD)
    }

    /// 对全部任务记录跑一遍探测（根任务启动与每轮迭代时调用）
    pub async fn reconcile_all(&self) -> Result<usize, HiveError> {
        let task_ids = self.store().list_task_ids().await?;
        let count = task_ids.len();
        for task_id in task_ids {
            // 单个任务探测失败不阻断其余任务
            if let Err(e) = self.probe(&task_id).await {
                debug!(task_id = %task_id, error = %e, "probe failed during reconcile");
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskRecord, TokenUsage};
    use chrono::Utc;

    fn record(task_id: &str, status: TaskStatus, worker_id: Option<u64>) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            parent_task_id: None,
            model_id: "standard".into(),
            static_system_prompt: String::new(),
            enable_recursion: true,
            status,
            worker_id,
            created_at: Utc::now(),
            process_started_at: Utc::now(),
            max_iterations: 250,
            last_usage: TokenUsage::default(),
            children: vec![],
        }
    }

    #[tokio::test]
    async fn test_probe_unknown_task_is_dead() {
        let rt = Runtime::new_in_memory(Default::default());
        let activity = rt.probe("missing").await.unwrap();
        assert_eq!(activity, TaskActivity::DEAD);
    }

    #[tokio::test]
    async fn test_probe_reconciles_stale_worker_id() {
        let rt = Runtime::new_in_memory(Default::default());
        // 记录声称 running / worker 99，注册表并不认识
        rt.store()
            .save_record(&record("t1", TaskStatus::Running, Some(99)))
            .await
            .unwrap();
        let mut events = rt.store().subscribe_task_events("t1").await;

        let activity = rt.probe("t1").await.unwrap();
        assert!(!activity.alive);

        let reconciled = rt.store().require_record("t1").await.unwrap();
        assert_eq!(reconciled.status, TaskStatus::Stopped);
        assert_eq!(reconciled.worker_id, None);
        assert_eq!(events.recv().await.unwrap()["type"], "process_ended");
    }

    #[tokio::test]
    async fn test_probe_leaves_cleanly_stopped_task_alone() {
        let rt = Runtime::new_in_memory(Default::default());
        rt.store()
            .save_record(&record("t1", TaskStatus::Stopped, None))
            .await
            .unwrap();
        let mut events = rt.store().subscribe_task_events("t1").await;

        let activity = rt.probe("t1").await.unwrap();
        assert!(!activity.alive);
        // 已经干净停止的任务不再广播
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_all_sweeps_every_record() {
        let rt = Runtime::new_in_memory(Default::default());
        rt.store()
            .save_record(&record("a", TaskStatus::Running, Some(1)))
            .await
            .unwrap();
        rt.store()
            .save_record(&record("b", TaskStatus::Running, Some(2)))
            .await
            .unwrap();

        assert_eq!(rt.reconcile_all().await.unwrap(), 2);
        for id in ["a", "b"] {
            assert_eq!(
                rt.store().require_record(id).await.unwrap().status,
                TaskStatus::Stopped
            );
        }
    }
}
