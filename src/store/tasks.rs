//! 任务文档的类型化访问
//!
//! 把原始的键 / 路径操作收拢到一个适配器里：任务记录、会话、收件箱、
//! 在场标记与事件通道。追加操作一律返回新长度，调用方据此编号，
//! 不允许沿用追加前读到的下标。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::HiveError;
use crate::model::{Envelope, Message, TaskRecord, TaskStatus, TokenUsage, Turn};

use super::{
    api_call_key, conversation_key, queue_key, task_data_key, task_events_channel,
    DocumentStore, PathSeg,
};

/// 类型化存储句柄；Clone 即共享底层存储
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<dyn DocumentStore>,
}

impl TaskStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self { inner }
    }

    /// 偶尔需要越过类型化接口时（节流通道等）使用
    pub fn raw(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    // ── 任务记录 ──

    pub async fn load_record(&self, task_id: &str) -> Result<Option<TaskRecord>, HiveError> {
        match self.inner.get(&task_data_key(task_id)).await? {
            None => Ok(None),
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
        }
    }

    pub async fn require_record(&self, task_id: &str) -> Result<TaskRecord, HiveError> {
        self.load_record(task_id)
            .await?
            .ok_or_else(|| HiveError::TaskNotFound(task_id.to_string()))
    }

    pub async fn save_record(&self, record: &TaskRecord) -> Result<(), HiveError> {
        self.inner
            .set(&task_data_key(&record.task_id), serde_json::to_value(record)?)
            .await
    }

    pub async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<(), HiveError> {
        self.inner
            .set_path(
                &task_data_key(task_id),
                &[PathSeg::field("status")],
                serde_json::to_value(status)?,
            )
            .await
    }

    pub async fn set_worker(
        &self,
        task_id: &str,
        worker_id: Option<u64>,
    ) -> Result<(), HiveError> {
        self.inner
            .set_path(
                &task_data_key(task_id),
                &[PathSeg::field("worker_id")],
                serde_json::to_value(worker_id)?,
            )
            .await
    }

    pub async fn set_last_usage(
        &self,
        task_id: &str,
        usage: TokenUsage,
    ) -> Result<(), HiveError> {
        self.inner
            .set_path(
                &task_data_key(task_id),
                &[PathSeg::field("last_usage")],
                serde_json::to_value(usage)?,
            )
            .await
    }

    /// 把子任务 id 追加到父记录的 children（仅供查看）
    pub async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<(), HiveError> {
        let record = self.require_record(parent_id).await?;
        if record.children.iter().any(|c| c == child_id) {
            return Ok(());
        }
        self.inner
            .append(
                &task_data_key(parent_id),
                &[PathSeg::field("children")],
                Value::String(child_id.to_string()),
            )
            .await?;
        Ok(())
    }

    /// 所有任务 id（task_data: 前缀扫描）
    pub async fn list_task_ids(&self) -> Result<Vec<String>, HiveError> {
        let prefix = "task_data:";
        Ok(self
            .inner
            .list_keys(prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
            .collect())
    }

    // ── 会话 ──

    pub async fn conversation_exists(&self, task_id: &str) -> Result<bool, HiveError> {
        Ok(self.inner.get(&conversation_key(task_id)).await?.is_some())
    }

    /// 缺失视为空会话
    pub async fn load_conversation(&self, task_id: &str) -> Result<Vec<Turn>, HiveError> {
        match self.inner.get(&conversation_key(task_id)).await? {
            None => Ok(Vec::new()),
            Some(doc) => Ok(serde_json::from_value(doc)?),
        }
    }

    /// 仅供首次创建；已有会话一律走追加路径
    pub async fn init_conversation(
        &self,
        task_id: &str,
        turns: Vec<Turn>,
    ) -> Result<(), HiveError> {
        self.inner
            .set(&conversation_key(task_id), serde_json::to_value(turns)?)
            .await
    }

    /// 追加新回合，返回新的回合总数
    pub async fn push_turn(&self, task_id: &str, turn: Turn) -> Result<usize, HiveError> {
        self.inner
            .append(&conversation_key(task_id), &[], serde_json::to_value(turn)?)
            .await
    }

    /// 向指定回合追加消息，返回该回合新的消息总数
    pub async fn append_message(
        &self,
        task_id: &str,
        turn_index: usize,
        message: &Message,
    ) -> Result<usize, HiveError> {
        self.inner
            .append(
                &conversation_key(task_id),
                &[PathSeg::Index(turn_index), PathSeg::field("messages")],
                serde_json::to_value(message)?,
            )
            .await
    }

    /// 回合关闭后写一次摘要
    pub async fn set_turn_summary(
        &self,
        task_id: &str,
        turn_index: usize,
        summary: &str,
    ) -> Result<(), HiveError> {
        self.inner
            .set_path(
                &conversation_key(task_id),
                &[PathSeg::Index(turn_index), PathSeg::field("turn_summary")],
                Value::String(summary.to_string()),
            )
            .await
    }

    // ── 收件箱 ──

    pub async fn enqueue_envelope(
        &self,
        task_id: &str,
        envelope: &Envelope,
    ) -> Result<usize, HiveError> {
        self.inner
            .append(&queue_key(task_id), &[], serde_json::to_value(envelope)?)
            .await
    }

    /// 原子取走整个收件箱
    pub async fn take_envelopes(&self, task_id: &str) -> Result<Vec<Envelope>, HiveError> {
        let items = self.inner.take_list(&queue_key(task_id)).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(HiveError::from))
            .collect()
    }

    pub async fn queue_len(&self, task_id: &str) -> Result<usize, HiveError> {
        match self.inner.get(&queue_key(task_id)).await? {
            Some(Value::Array(items)) => Ok(items.len()),
            _ => Ok(0),
        }
    }

    // ── 标记与事件 ──

    pub async fn set_api_call_marker(
        &self,
        task_id: &str,
        marker: Value,
    ) -> Result<(), HiveError> {
        self.inner.set(&api_call_key(task_id), marker).await
    }

    pub async fn clear_api_call_marker(&self, task_id: &str) -> Result<(), HiveError> {
        self.inner.delete(&api_call_key(task_id)).await
    }

    pub async fn publish_task_event(&self, task_id: &str, event: Value) -> Result<(), HiveError> {
        self.inner.publish(&task_events_channel(task_id), event).await
    }

    pub async fn subscribe_task_events(&self, task_id: &str) -> broadcast::Receiver<Value> {
        self.inner.subscribe(&task_events_channel(task_id)).await
    }
}
