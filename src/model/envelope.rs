//! 收件箱信封
//!
//! 任何生产者（操作员、父任务、子任务、任务自身的工具结果）都只通过
//! 信封进入任务收件箱，由 Ingester 统一合入会话。收件箱只存放尚未合入的信封。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conversation::ToolResultBlock;

/// 信封载荷，kind 决定合入会话时的分组方式
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    /// 普通用户输入，合入为独立 user 消息
    User { text: String },
    /// 子任务完成通报，同样合入为独立 user 消息
    Completion { text: String },
    /// 工具结果；同一次 drain 内的所有工具结果合并为一条 user 消息
    ToolResult { result: ToolResultBlock },
}

/// 收件箱中的一条信封
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn user(text: impl Into<String>, sender_id: Option<String>) -> Self {
        Self {
            body: EnvelopeBody::User { text: text.into() },
            sender_id,
            sent_at: Utc::now(),
        }
    }

    pub fn completion(text: impl Into<String>, sender_id: Option<String>) -> Self {
        Self {
            body: EnvelopeBody::Completion { text: text.into() },
            sender_id,
            sent_at: Utc::now(),
        }
    }

    pub fn tool_result(result: ToolResultBlock, sender_id: Option<String>) -> Self {
        Self {
            body: EnvelopeBody::ToolResult { result },
            sender_id,
            sent_at: Utc::now(),
        }
    }

    /// 仅 tool_result 信封携带配对 id
    pub fn tool_use_id(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::ToolResult { result } => Some(result.id.as_str()),
            _ => None,
        }
    }
}
