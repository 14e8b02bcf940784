//! 会话结构：回合（Turn）、消息、内容块
//!
//! 会话是回合的有序列表；回合内消息以 user 开头严格交替；
//! 回合结束的判定：最后一条为含文本且无 tool_use 的 assistant 消息。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM 线上协议一致，仅 user / assistant 两种）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// assistant 发出的工具调用请求块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// 工具结果状态；缺省视为成功
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
}

/// 工具结果块：id 必须与前一条 assistant 消息中的某个 tool_use 配对
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub id: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolResultStatus>,
}

impl ToolResultBlock {
    /// 成功结果：content 为单个文本块（JSON 序列化后的工具返回值）
    pub fn success(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: vec![ContentBlock::Text(text.into())],
            status: None,
        }
    }

    /// 失败结果：payload 为 {"error": message}
    pub fn error(id: impl Into<String>, message: &str) -> Self {
        let payload = serde_json::json!({ "error": message });
        Self {
            id: id.into(),
            content: vec![ContentBlock::Text(payload.to_string())],
            status: Some(ToolResultStatus::Error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, Some(ToolResultStatus::Error))
    }
}

/// 消息内容块：文本 / 工具调用 / 工具结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            Self::ToolUse(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultBlock> {
        match self {
            Self::ToolResult(b) => Some(b),
            _ => None,
        }
    }
}

/// 单条消息：角色、内容块列表与簿记字段（回合内序号、时间戳）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub message_number: usize,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>, message_number: usize) -> Self {
        Self {
            role,
            content,
            message_number,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: Vec<ContentBlock>, message_number: usize) -> Self {
        Self::new(Role::User, content, message_number)
    }

    pub fn assistant(content: Vec<ContentBlock>, message_number: usize) -> Self {
        Self::new(Role::Assistant, content, message_number)
    }

    /// 本条消息中所有 tool_use 的 id（按出现顺序）
    pub fn tool_use_ids(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|b| b.as_tool_use().map(|t| t.id.clone()))
            .collect()
    }

    pub fn has_text(&self) -> bool {
        self.content.iter().any(|b| matches!(b, ContentBlock::Text(_)))
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(|b| matches!(b, ContentBlock::ToolUse(_)))
    }

    /// 回合结束消息：assistant 且含文本、不含 tool_use
    pub fn is_turn_ending(&self) -> bool {
        self.role == Role::Assistant && self.has_text() && !self.has_tool_use()
    }

    /// 拼接所有文本块（assistant 最终回复提取用）
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 一个回合：从 user 发起到下一条回合结束 assistant 回复的最大连续段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_number: usize,
    pub started_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_summary: Option<String>,
}

impl Turn {
    pub fn new(turn_number: usize) -> Self {
        Self {
            turn_number,
            started_at: Utc::now(),
            messages: Vec::new(),
            turn_summary: None,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 回合已关闭：最后一条消息是回合结束消息
    pub fn is_closed(&self) -> bool {
        self.last_message().is_some_and(Message::is_turn_ending)
    }
}

/// 提交给 LLM 的线上消息：仅 role + content，不带簿记字段
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// 整个会话中最后一条 assistant 消息的文本（子任务完成通报用）
pub fn final_assistant_text(turns: &[Turn]) -> Option<String> {
    for turn in turns.iter().rev() {
        for msg in turn.messages.iter().rev() {
            if msg.role == Role::Assistant {
                let text = msg.joined_text();
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_ending_detection() {
        let closing = Message::assistant(vec![ContentBlock::text("done")], 1);
        assert!(closing.is_turn_ending());

        let tool_call = Message::assistant(
            vec![
                ContentBlock::text("let me check"),
                ContentBlock::ToolUse(ToolUseBlock {
                    id: "u1".into(),
                    name: "clock".into(),
                    input: serde_json::json!({}),
                }),
            ],
            1,
        );
        assert!(!tool_call.is_turn_ending());

        let user = Message::user(vec![ContentBlock::text("hi")], 0);
        assert!(!user.is_turn_ending());

        // 无文本的 assistant 消息不算回合结束
        let empty = Message::assistant(vec![], 1);
        assert!(!empty.is_turn_ending());
    }

    #[test]
    fn test_content_block_wire_shape() {
        let text = serde_json::to_value(ContentBlock::text("hello")).unwrap();
        assert_eq!(text, serde_json::json!({ "text": "hello" }));

        let tool_use = serde_json::to_value(ContentBlock::ToolUse(ToolUseBlock {
            id: "u1".into(),
            name: "clock".into(),
            input: serde_json::json!({}),
        }))
        .unwrap();
        assert_eq!(
            tool_use,
            serde_json::json!({ "tool_use": { "id": "u1", "name": "clock", "input": {} } })
        );

        let result = serde_json::to_value(ContentBlock::ToolResult(ToolResultBlock::success(
            "u1", "{\"now\":\"12:00\"}",
        )))
        .unwrap();
        assert_eq!(
            result,
            serde_json::json!({
                "tool_result": { "id": "u1", "content": [ { "text": "{\"now\":\"12:00\"}" } ] }
            })
        );
    }

    #[test]
    fn test_final_assistant_text_searches_backwards() {
        let mut t0 = Turn::new(0);
        t0.messages.push(Message::user(vec![ContentBlock::text("q")], 0));
        t0.messages
            .push(Message::assistant(vec![ContentBlock::text("first")], 1));
        let mut t1 = Turn::new(1);
        t1.messages.push(Message::user(vec![ContentBlock::text("q2")], 0));
        t1.messages
            .push(Message::assistant(vec![ContentBlock::text("final answer")], 1));

        assert_eq!(
            final_assistant_text(&[t0, t1]),
            Some("final answer".to_string())
        );
        assert_eq!(final_assistant_text(&[]), None);
    }
}
