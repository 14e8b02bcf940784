//! 收件箱合入
//!
//! 入站消息进入会话的唯一写入口。enqueue 只做原子追加，不看会话；
//! drain 原子取走整个收件箱，按当时的会话与任务状态决定回合边界，
//! 再按分组规则合入：同批工具结果并成一条 user 消息先进，
//! 其余 user / completion 信封各自成条、按到达顺序排在其后。

use serde_json::json;
use tracing::{debug, info};

use crate::error::HiveError;
use crate::model::{ContentBlock, Envelope, EnvelopeBody, Message, TaskStatus, Turn};
use crate::store::TaskStore;

/// 收件箱合入器；Clone 共享底层存储
#[derive(Clone)]
pub struct Ingester {
    store: TaskStore,
}

impl Ingester {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// 生产者入口：原子追加到收件箱（惰性建列表），与合入完全解耦
    pub async fn enqueue(&self, task_id: &str, envelope: Envelope) -> Result<(), HiveError> {
        let depth = self.store.enqueue_envelope(task_id, &envelope).await?;
        debug!(task_id, depth, kind = ?envelope_kind(&envelope), "envelope queued");
        Ok(())
    }

    /// 把收件箱全部合入会话，返回合入的消息条数
    pub async fn drain(&self, task_id: &str) -> Result<usize, HiveError> {
        let envelopes = self.store.take_envelopes(task_id).await?;
        if envelopes.is_empty() {
            return Ok(0);
        }

        let record = self.store.require_record(task_id).await?;
        let turns = self.store.load_conversation(task_id).await?;
        let stopped = record.status == TaskStatus::Stopped;

        // 回合边界：无回合 / 尾回合为空 → 使用新的空回合；
        // 已停止且尾回合已关闭 → 开新回合；其余情况续写尾回合
        let turn_index = match turns.last() {
            None => {
                let len = self.store.push_turn(task_id, Turn::new(0)).await?;
                len - 1
            }
            Some(tail) if tail.messages.is_empty() => turns.len() - 1,
            Some(tail) if stopped && tail.is_closed() => {
                let len = self
                    .store
                    .push_turn(task_id, Turn::new(turns.len()))
                    .await?;
                len - 1
            }
            Some(_) => turns.len() - 1,
        };

        // 追加起点的编号以存储返回的长度为准，不复用取边界时读到的快照
        let mut next_number = self
            .store
            .load_conversation(task_id)
            .await?
            .get(turn_index)
            .map(|t| t.messages.len())
            .unwrap_or(0);

        let mut tool_results = Vec::new();
        let mut texts = Vec::new();
        for envelope in envelopes {
            match envelope.body {
                EnvelopeBody::ToolResult { result } => {
                    tool_results.push(ContentBlock::ToolResult(result))
                }
                EnvelopeBody::User { text } | EnvelopeBody::Completion { text } => {
                    texts.push(text)
                }
            }
        }

        let mut appended = 0usize;

        if !tool_results.is_empty() {
            let message = Message::user(tool_results, next_number);
            next_number = self.store.append_message(task_id, turn_index, &message).await?;
            appended += 1;
        }

        for text in texts {
            let message = Message::user(vec![ContentBlock::text(text)], next_number);
            next_number = self.store.append_message(task_id, turn_index, &message).await?;
            appended += 1;
        }

        info!(task_id, turn = turn_index, appended, "inbox merged into conversation");
        self.store
            .publish_task_event(
                task_id,
                json!({
                    "type": "messages_appended",
                    "turn_number": turn_index,
                    "count": appended,
                }),
            )
            .await?;

        Ok(appended)
    }
}

fn envelope_kind(envelope: &Envelope) -> &'static str {
    match envelope.body {
        EnvelopeBody::User { .. } => "user",
        EnvelopeBody::Completion { .. } => "completion",
        EnvelopeBody::ToolResult { .. } => "tool_result",
    }
}
