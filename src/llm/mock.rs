//! 脚本化 Mock 客户端（测试与本地联调用，无需 API）
//!
//! 按模型 id 维护响应队列，converse 时取队首；队列耗尽则回显最后一条
//! user 文本，便于在没有真实端点的环境跑通整个编排流程。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{ContentBlock, Role, TokenUsage, ToolUseBlock};

use super::{LlmClient, LlmError, ModelRequest, ModelResponse, StopReason};

/// 脚本化客户端：push_response 预置响应，converse 按模型顺序消费
#[derive(Default)]
pub struct ScriptedLlm {
    queues: Mutex<HashMap<String, VecDeque<ModelResponse>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, model_id: &str, response: ModelResponse) {
        self.queues
            .lock()
            .expect("scripted llm lock")
            .entry(model_id.to_string())
            .or_default()
            .push_back(response);
    }

    /// 便捷构造：纯文本回复，回合结束
    pub fn text_response(text: impl Into<String>) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                total_tokens: 150,
            }),
        }
    }

    /// 便捷构造：单个工具调用
    pub fn tool_use_response(id: &str, name: &str, input: Value) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::ToolUse(ToolUseBlock {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })],
            stop_reason: StopReason::ToolUse,
            usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
                total_tokens: 130,
            }),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn converse(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        if let Some(response) = self
            .queues
            .lock()
            .expect("scripted llm lock")
            .get_mut(&request.model_id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }

        // 队列耗尽：回显最后一条 user 文本
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.iter().find_map(|b| b.as_text()))
            .unwrap_or("(no input)");
        Ok(Self::text_response(format!("Echo: {last_user}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WireMessage;

    fn request(model_id: &str, text: &str) -> ModelRequest {
        ModelRequest {
            model_id: model_id.to_string(),
            system_prompt: String::new(),
            messages: vec![WireMessage {
                role: Role::User,
                content: vec![ContentBlock::text(text)],
            }],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_responses_consumed_per_model_in_order() {
        let llm = ScriptedLlm::new();
        llm.push_response("alpha", ScriptedLlm::text_response("first"));
        llm.push_response("alpha", ScriptedLlm::text_response("second"));
        llm.push_response("beta", ScriptedLlm::text_response("other model"));

        let r = llm.converse(&request("alpha", "hi")).await.unwrap();
        assert_eq!(r.first_text(), Some("first"));
        let r = llm.converse(&request("beta", "hi")).await.unwrap();
        assert_eq!(r.first_text(), Some("other model"));
        let r = llm.converse(&request("alpha", "hi")).await.unwrap();
        assert_eq!(r.first_text(), Some("second"));
    }

    #[tokio::test]
    async fn test_exhausted_queue_echoes_last_user_text() {
        let llm = ScriptedLlm::new();
        let r = llm.converse(&request("alpha", "anyone there?")).await.unwrap();
        assert_eq!(r.first_text(), Some("Echo: anyone there?"));
        assert_eq!(r.stop_reason, StopReason::EndTurn);
    }
}
