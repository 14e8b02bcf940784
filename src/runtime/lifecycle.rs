//! 任务生命周期
//!
//! launch 的决策矩阵：
//! - 给定 id 且存活        → resume：只入队初始消息，不再 spawn
//! - 给定 id、已停、会话在 → reactivate：更新记录、保留会话、入队、按需 spawn
//! - 给定 id、无会话       → create-with-id：写记录与空回合 0，入队，按需 spawn
//! - 未给 id               → 分配 id 后同 create-with-id
//!
//! 硬性约束：已存在的会话永不覆盖，判断依据是会话键的有无而非存活状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::HiveError;
use crate::model::{Envelope, TaskRecord, TaskStatus, TokenUsage, Turn};
use crate::prompts::build_static_system_prompt;

use super::worker::run_worker;
use super::Runtime;

/// launch 参数
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// 既有任务 id；为空时分配新 id
    pub task_id: Option<String>,
    /// 模型短名或完整 id；为空时沿用既有记录（新任务用配置默认值）
    pub model: Option<String>,
    /// 为空时沿用既有记录（新任务默认允许递归）
    pub enable_recursion: Option<bool>,
    /// 作为 user 信封入队的初始消息
    pub initial_messages: Vec<String>,
    pub parent_task_id: Option<String>,
    /// 新建子任务的名字底座（1-3 个词），子任务必填
    pub base_name: Option<String>,
    /// 为空时沿用既有记录（新任务用配置默认值）
    pub max_iterations: Option<u32>,
    /// false 时只准备状态，由第一次用户动作启动 worker
    pub start_worker: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            model: None,
            enable_recursion: None,
            initial_messages: Vec::new(),
            parent_task_id: None,
            base_name: None,
            max_iterations: None,
            start_worker: true,
        }
    }
}

/// 任务 id 生成：根任务 conversation_{hex6}，子任务 {base_name}_{hex6}
pub(crate) fn generate_task_id(
    parent_task_id: Option<&str>,
    base_name: Option<&str>,
) -> Result<String, HiveError> {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    match parent_task_id {
        None => Ok(format!("conversation_{suffix}")),
        Some(_) => {
            let base = base_name.ok_or_else(|| {
                HiveError::Config("base_name is required for child tasks (1-3 words)".to_string())
            })?;
            let normalized = base.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_");
            Ok(format!("{normalized}_{suffix}"))
        }
    }
}

impl Runtime {
    /// 创建 / 唤醒 / 续用任务，返回 (worker_id, task_id)
    pub async fn launch(
        self: &Arc<Self>,
        options: LaunchOptions,
    ) -> Result<(Option<u64>, String), HiveError> {
        let task_id = match &options.task_id {
            Some(id) => id.clone(),
            None => generate_task_id(
                options.parent_task_id.as_deref(),
                options.base_name.as_deref(),
            )?,
        };

        let activity = self.probe(&task_id).await?;
        if activity.alive {
            // resume：存活的 worker 会在下一次迭代 drain 到新消息
            info!(task_id = %task_id, worker_id = ?activity.worker_id, "task already running, queueing only");
            for text in &options.initial_messages {
                self.ingester()
                    .enqueue(&task_id, Envelope::user(text.clone(), None))
                    .await?;
            }
            return Ok((activity.worker_id, task_id));
        }

        if self.store().conversation_exists(&task_id).await? {
            self.reactivate_record(&task_id, &options).await?;
        } else {
            self.create_task(&task_id, &options).await?;
        }

        for text in &options.initial_messages {
            self.ingester()
                .enqueue(&task_id, Envelope::user(text.clone(), None))
                .await?;
        }

        let mut worker_id = None;
        if options.start_worker && self.store().queue_len(&task_id).await? > 0 {
            worker_id = Some(self.spawn_worker(&task_id).await?);
        }

        Ok((worker_id, task_id))
    }

    /// reactivate：更新控制字段，绝不动会话
    async fn reactivate_record(
        &self,
        task_id: &str,
        options: &LaunchOptions,
    ) -> Result<(), HiveError> {
        info!(task_id, "reactivating existing task");
        let mut record = match self.store().load_record(task_id).await? {
            Some(record) => record,
            // 会话在而记录丢失:重建控制块，会话保持原样
            None => {
                warn!(task_id, "conversation exists without record, rebuilding record");
                self.build_record(task_id, options)
            }
        };
        if let Some(model) = &options.model {
            record.model_id = self.config().llm.resolve_model(model);
        }
        if let Some(enable_recursion) = options.enable_recursion {
            record.enable_recursion = enable_recursion;
        }
        if let Some(max_iterations) = options.max_iterations {
            record.max_iterations = max_iterations;
        }
        record.process_started_at = Utc::now();
        self.store().save_record(&record).await
    }

    /// create：写记录与空回合 0 的会话
    async fn create_task(&self, task_id: &str, options: &LaunchOptions) -> Result<(), HiveError> {
        info!(task_id, parent = ?options.parent_task_id, "creating new task");
        let record = self.build_record(task_id, options);
        self.store().save_record(&record).await?;
        self.store()
            .init_conversation(task_id, vec![Turn::new(0)])
            .await
    }

    fn build_record(&self, task_id: &str, options: &LaunchOptions) -> TaskRecord {
        let model_id = self.config().llm.resolve_model(
            options
                .model
                .as_deref()
                .unwrap_or(&self.config().llm.default_model),
        );
        TaskRecord {
            task_id: task_id.to_string(),
            parent_task_id: options.parent_task_id.clone(),
            model_id,
            static_system_prompt: build_static_system_prompt(options.parent_task_id.as_deref()),
            enable_recursion: options.enable_recursion.unwrap_or(true),
            status: TaskStatus::Stopped,
            worker_id: None,
            created_at: Utc::now(),
            process_started_at: Utc::now(),
            max_iterations: options
                .max_iterations
                .unwrap_or(self.config().runner.max_iterations),
            last_usage: TokenUsage::default(),
            children: Vec::new(),
        }
    }

    /// 启动 worker：先登记再 spawn，launch 返回后探测立即可见
    pub(crate) async fn spawn_worker(self: &Arc<Self>, task_id: &str) -> Result<u64, HiveError> {
        let worker_id = self.workers().allocate_id();
        let cancel = CancellationToken::new();
        self.workers().register(worker_id, cancel.clone()).await;
        // 只写 worker 身份;status 由首次合入后的迭代引擎翻转,
        // 这样重新激活的首次 drain 仍按"已停止"判定回合边界
        self.store().set_worker(task_id, Some(worker_id)).await?;

        let runtime = Arc::clone(self);
        let tid = task_id.to_string();
        let join = tokio::spawn(run_worker(runtime, tid, worker_id, cancel));
        self.workers().attach(worker_id, join).await;

        info!(task_id, worker_id, "worker spawned");
        Ok(worker_id)
    }

    /// 停止任务：协作式取消，宽限期后强杀，确认死亡后收敛记录并广播
    pub async fn stop(&self, task_id: &str) -> Result<(), HiveError> {
        let activity = self.probe(task_id).await?;
        let Some(worker_id) = activity.worker_id.filter(|_| activity.alive) else {
            return Ok(());
        };

        info!(task_id, worker_id, "stopping task");
        self.workers().cancel(worker_id).await;

        let grace = Duration::from_secs(self.config().runner.stop_grace_secs);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.workers().is_alive(worker_id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.workers().is_alive(worker_id).await {
            warn!(task_id, worker_id, "grace window elapsed, force killing worker");
            self.workers().abort(worker_id).await;
        }

        self.store().set_worker(task_id, None).await?;
        self.store().set_status(task_id, TaskStatus::Stopped).await?;
        self.store()
            .publish_task_event(task_id, json!({ "type": "process_ended" }))
            .await?;
        self.workers().remove(worker_id).await;
        Ok(())
    }
}
