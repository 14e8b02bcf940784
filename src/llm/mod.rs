//! LLM 客户端抽象
//!
//! Converse 风格契约：提交 {model_id, messages, system_prompt, tools}，
//! 返回内容块列表 + 停止原因 + 可选用量。限流类失败与其他传输失败
//! 在错误类型上分开，便于节流协调器区别对待。

pub mod http;
pub mod mock;

pub use http::ConverseHttpClient;
pub use mock::ScriptedLlm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ContentBlock, TokenUsage, WireMessage};

/// 响应停止原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    /// 服务端新增的停止原因一律按回合结束处理
    #[serde(other)]
    Other,
}

/// 提供给模型的工具声明
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 一次模型调用的输入
#[derive(Clone, Debug, Serialize)]
pub struct ModelRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub messages: Vec<WireMessage>,
    pub tools: Vec<ToolSpec>,
}

/// 一次模型调用的输出
#[derive(Clone, Debug, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    /// 响应中的 tool_use 块（停止原因为 tool_use 时非空）
    pub fn tool_uses(&self) -> Vec<&crate::model::ToolUseBlock> {
        self.content.iter().filter_map(|b| b.as_tool_use()).collect()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| b.as_text())
    }
}

/// LLM 调用错误
#[derive(Error, Debug)]
pub enum LlmError {
    /// 限流类拒绝（含服务过载），由节流协调器退避
    #[error("throttled: {0}")]
    Throttled(String),

    /// 网络 / 超时等传输层失败
    #[error("transport error: {0}")]
    Transport(String),

    /// 服务端返回的非限流错误
    #[error("api error {code}: {message}")]
    Api { code: String, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn converse(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError>;
}
