//! 任务查询工具
//!
//! 被动查询另一个任务：取其转写与存活状态，发一次无工具的 LLM 调用回答问题。
//! 不向目标任务写入任何状态。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::ModelRequest;
use crate::model::{ContentBlock, Role, WireMessage};
use crate::prompts::transcribe;

use super::{Tool, ToolContext};

const QUERY_SYSTEM_PROMPT: &str = "You are a helpful assistant analyzing task conversations.";

pub struct QueryTaskTool;

#[async_trait]
impl Tool for QueryTaskTool {
    fn name(&self) -> &str {
        "query_task"
    }

    fn description(&self) -> &str {
        "Ask a question about a task's conversation history and current status"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string", "description": "The task ID to query" },
                "question": { "type": "string", "description": "The question to ask about the task" },
                "model": { "type": "string", "description": "Model short name to use (defaults to the configured default model)" }
            },
            "required": ["task_id", "question"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let target_task_id = args
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: task_id".to_string())?;
        let question = args
            .get("question")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: question".to_string())?;

        let store = ctx.runtime.store();
        if store
            .load_record(target_task_id)
            .await
            .map_err(|e| e.to_string())?
            .is_none()
        {
            return Err(format!("Task {target_task_id} not found"));
        }

        let activity = ctx
            .runtime
            .probe(target_task_id)
            .await
            .map_err(|e| e.to_string())?;
        let status = if activity.alive { "running" } else { "stopped" };

        let turns = store
            .load_conversation(target_task_id)
            .await
            .map_err(|e| e.to_string())?;
        let transcript = transcribe(&turns, true);

        let config = ctx.runtime.config();
        let model_id = config.llm.resolve_model(
            args.get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(&config.llm.default_model),
        );

        let prompt = format!(
            "You are analyzing a task's conversation history and status.\n\n\
             Task ID: {target_task_id}\n\
             Current Status: {status}\n\n\
             Conversation Transcript:\n{transcript}\n\n\
             Question: {question}\n\n\
             Please answer the question based on the conversation transcript and task status above."
        );

        let request = ModelRequest {
            model_id: model_id.clone(),
            system_prompt: QUERY_SYSTEM_PROMPT.to_string(),
            messages: vec![WireMessage {
                role: Role::User,
                content: vec![ContentBlock::text(prompt)],
            }],
            tools: vec![],
        };
        let response = ctx
            .runtime
            .llm()
            .converse(&request)
            .await
            .map_err(|e| e.to_string())?;
        let answer = response.first_text().unwrap_or_default().to_string();

        Ok(json!({
            "task_id": target_task_id,
            "status": status,
            "question": question,
            "answer": answer,
            "model_used": model_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::runtime::{LaunchOptions, Runtime};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_query_unknown_task_fails() {
        let runtime = Runtime::new_in_memory(Default::default());
        let ctx = ToolContext {
            task_id: "caller".into(),
            runtime: Arc::clone(&runtime),
        };
        let err = QueryTaskTool
            .execute(json!({ "task_id": "nope", "question": "alive?" }), &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_query_returns_answer_and_status() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_response("standard", ScriptedLlm::text_response("it finished fine"));
        let runtime = Runtime::new_with_llm(Default::default(), llm);

        let (_, task_id) = runtime
            .launch(LaunchOptions {
                initial_messages: vec![],
                start_worker: false,
                ..LaunchOptions::default()
            })
            .await
            .unwrap();

        let ctx = ToolContext {
            task_id: "caller".into(),
            runtime: Arc::clone(&runtime),
        };
        let out = QueryTaskTool
            .execute(json!({ "task_id": task_id, "question": "did it finish?" }), &ctx)
            .await
            .unwrap();
        assert_eq!(out["status"], "stopped");
        assert_eq!(out["answer"], "it finished fine");
    }
}
