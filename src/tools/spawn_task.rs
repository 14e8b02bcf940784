//! 子任务派生工具
//!
//! 派生新子任务或用新消息唤醒既有任务。默认把调用方会话的转写作为
//! 子任务的第一条消息（形成分支点）；zero_context 关闭转写时，
//! initial_message 必须自带全部上下文。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::prompts::transcribe;
use crate::runtime::LaunchOptions;

use super::{Tool, ToolContext};

const TRANSCRIPT_HEADER: &str = "[SYSTEM] The following is a transcription of your parent task's \
conversation history. Use it to understand the context of the task:\n\n";
const TRANSCRIPT_FOOTER: &str = "\n\n[SYSTEM] Given the context above, you are now ready to begin \
your task:\n\n";

pub struct SpawnTaskTool;

#[async_trait]
impl Tool for SpawnTaskTool {
    fn name(&self) -> &str {
        "spawn_task"
    }

    fn description(&self) -> &str {
        "Spawn a child task with an initial message, or resume an existing task with a new \
         message. By default the child receives a transcription of this task's conversation \
         (creating a branch point). Returns task_id for monitoring."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "base_name": {
                    "type": "string",
                    "description": "Base name for a new task (1-3 words describing it, e.g. 'analyze data'). Required when creating a new task."
                },
                "initial_message": {
                    "type": "string",
                    "description": "Initial user message for the child task"
                },
                "task_id": {
                    "type": "string",
                    "description": "Optional: existing task_id to resume. If provided, base_name is ignored."
                },
                "model": {
                    "type": "string",
                    "description": "Model short name (defaults to the configured default model)"
                },
                "zero_context": {
                    "type": "boolean",
                    "description": "If true, spawn the child WITHOUT this task's conversation history (default: false). Requires a very detailed initial_message."
                }
            },
            "required": ["initial_message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let initial_message = args
            .get("initial_message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: initial_message".to_string())?;
        let existing_task_id = args.get("task_id").and_then(|v| v.as_str());
        let base_name = args.get("base_name").and_then(|v| v.as_str());
        let model = args.get("model").and_then(|v| v.as_str());
        let zero_context = args
            .get("zero_context")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if existing_task_id.is_none() && base_name.is_none() {
            return Err(
                "base_name is required when creating a new child task (1-3 words describing it)"
                    .to_string(),
            );
        }

        let mut initial_messages = Vec::new();
        if !zero_context {
            let parent_turns = ctx
                .runtime
                .store()
                .load_conversation(&ctx.task_id)
                .await
                .map_err(|e| e.to_string())?;
            let transcript = transcribe(&parent_turns, false);
            initial_messages.push(format!("{TRANSCRIPT_HEADER}{transcript}{TRANSCRIPT_FOOTER}"));
        }
        initial_messages.push(initial_message.to_string());

        let options = LaunchOptions {
            task_id: existing_task_id.map(str::to_string),
            model: model.map(str::to_string),
            initial_messages,
            parent_task_id: Some(ctx.task_id.clone()),
            base_name: base_name.map(str::to_string),
            ..LaunchOptions::default()
        };
        let resumed = existing_task_id.is_some();
        let (worker_id, child_task_id) = ctx
            .runtime
            .launch(options)
            .await
            .map_err(|e| e.to_string())?;

        ctx.runtime
            .store()
            .add_child(&ctx.task_id, &child_task_id)
            .await
            .map_err(|e| e.to_string())?;

        let action = if resumed { "Resumed" } else { "Spawned" };
        Ok(json!({
            "success": true,
            "task_id": child_task_id,
            "worker_id": worker_id,
            "message": format!("{action} child task {child_task_id}"),
        }))
    }
}
