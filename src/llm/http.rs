//! Converse 风格 HTTP 客户端
//!
//! POST {base}/model/{model_id}/converse，请求体 {messages, system, toolConfig}，
//! 响应 {output.message.content, stopReason, usage}。429 与限流类错误码
//! 映射为 LlmError::Throttled，其余 HTTP 错误映射为 Api。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::model::{TokenUsage, WireMessage};

use super::{LlmClient, LlmError, ModelRequest, ModelResponse, StopReason};

/// 服务端以错误码（而非 429）表达限流的情况
const THROTTLE_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "ServiceUnavailable",
];

pub struct ConverseHttpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ConverseWireResponse {
    output: ConverseOutput,
    #[serde(rename = "stopReason")]
    stop_reason: StopReason,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ConverseOutput {
    message: WireMessage,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl ConverseHttpClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!("{}/model/{}/converse", self.base_url, model_id)
    }
}

#[async_trait]
impl LlmClient for ConverseHttpClient {
    async fn converse(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let mut body = json!({
            "messages": request.messages,
            "system": [ { "text": request.system_prompt } ],
        });
        if !request.tools.is_empty() {
            body["toolConfig"] = json!({ "tools": request.tools });
        }

        let mut req = self.http.post(self.endpoint(&request.model_id)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        debug!(model = %request.model_id, messages = request.messages.len(), "converse request");
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                // 超时当限流处理：原因大概率是上游过载，退避比立刻失败更有用
                LlmError::Throttled(format!("request timeout: {e}"))
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody {
                code: status.to_string(),
                message: String::new(),
            });
            if status.as_u16() == 429 || THROTTLE_ERROR_CODES.contains(&error.code.as_str()) {
                warn!(model = %request.model_id, code = %error.code, "throttling rejection");
                return Err(LlmError::Throttled(error.code));
            }
            return Err(LlmError::Api {
                code: error.code,
                message: error.message,
            });
        }

        let wire: ConverseWireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(ModelResponse {
            content: wire.output.message.content,
            stop_reason: wire.stop_reason,
            usage: wire.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_building() {
        let client = ConverseHttpClient::new("https://llm.internal/", None, 30);
        assert_eq!(
            client.endpoint("vendor.big-v1"),
            "https://llm.internal/model/vendor.big-v1/converse"
        );
    }

    #[test]
    fn test_wire_response_parsing() {
        let body = serde_json::json!({
            "output": {
                "message": {
                    "role": "assistant",
                    "content": [ { "text": "Hi" } ]
                }
            },
            "stopReason": "end_turn",
            "usage": { "inputTokens": 12, "outputTokens": 3, "totalTokens": 15 }
        });
        let wire: ConverseWireResponse = serde_json::from_value(body).unwrap();
        assert_eq!(wire.stop_reason, StopReason::EndTurn);
        assert_eq!(wire.output.message.content.len(), 1);
        assert_eq!(wire.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_unknown_stop_reason_maps_to_other() {
        let wire: StopReason = serde_json::from_value(serde_json::json!("guardrail")).unwrap();
        assert_eq!(wire, StopReason::Other);
    }
}
