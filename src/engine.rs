//! 迭代引擎
//!
//! 单次迭代：合入收件箱 → 修复视图 → 组装提示词 → 经节流闸门调用 LLM →
//! 持久化 assistant 消息 → 按停止原因分发工具 / 继续 / 收束回合并摘要。
//! 调用期间设置在场标记（task_api_call），观察方可据此看到进行中的请求。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::HiveError;
use crate::llm::{LlmError, ModelRequest, StopReason};
use crate::model::{ContentBlock, Message, Role, TaskRecord, TaskStatus, ToolUseBlock, WireMessage};
use crate::observability::Metrics;
use crate::prompts::{build_dynamic_system_prompt, iteration_notice, transcribe};
use crate::repair::repair_turns;
use crate::runtime::Runtime;
use crate::tools::ToolContext;

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a concise summarizer. Summarize the key work \
accomplished and decisions made in the provided turn. Be brief and factual.";

/// 一次迭代的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// 正常完成一次模型往返；turn_ending 表示回合已收束
    Completed { turn_ending: bool },
    /// 被限流，已退避；由外层决定是否重入
    Throttled,
    /// 任务被外部停止
    Cancelled,
}

/// 迭代引擎：借运行时句柄驱动单任务的一次模型往返
pub struct IterationEngine {
    runtime: Arc<Runtime>,
}

impl IterationEngine {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub async fn run_iteration(
        &self,
        task_id: &str,
        iteration: u32,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, HiveError> {
        let store = self.runtime.store();
        self.runtime.ingester().drain(task_id).await?;

        let record = store.require_record(task_id).await?;
        // 首次合入之后才把状态翻成 running:重新激活的首次 drain
        // 必须仍按"已停止"判定回合边界
        if record.status == TaskStatus::Stopped {
            store.set_status(task_id, TaskStatus::Running).await?;
        }
        let turns = store.load_conversation(task_id).await?;
        let Some(current_turn_index) = turns.len().checked_sub(1) else {
            // 没有任何回合:无事可做
            return Ok(IterationOutcome::Completed { turn_ending: false });
        };
        let message_count = turns[current_turn_index].messages.len();
        debug!(task_id, turn = current_turn_index, message_count, iteration, "iteration start");

        // 提交视图:修复后压平为 role + content
        let repaired = repair_turns(&turns);
        let messages: Vec<WireMessage> = repaired
            .iter()
            .flat_map(|t| t.messages.iter())
            .map(WireMessage::from)
            .collect();

        let parent_transcript = match &record.parent_task_id {
            Some(parent) => {
                let parent_turns = store.load_conversation(parent).await?;
                Some(transcribe(&parent_turns, true))
            }
            None => None,
        };
        let mut system_prompt = format!(
            "{}{}",
            record.static_system_prompt,
            build_dynamic_system_prompt(&record, current_turn_index, parent_transcript.as_deref())
        );
        if let Some(notice) = iteration_notice(iteration, max_iterations) {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&notice);
        }

        let request = ModelRequest {
            model_id: record.model_id.clone(),
            system_prompt,
            messages,
            tools: self.runtime.tools().specs(record.enable_recursion),
        };

        let gate = self.runtime.throttles().gate(&record.model_id).await;
        if gate.pause_before_call(record.last_usage, cancel).await.is_err() {
            return Ok(IterationOutcome::Cancelled);
        }

        store
            .set_api_call_marker(
                task_id,
                json!({
                    "started_at": Utc::now(),
                    "turn": current_turn_index,
                    "message_count": message_count,
                }),
            )
            .await?;
        let call_started = Instant::now();
        let result = self.runtime.llm().converse(&request).await;
        store.clear_api_call_marker(task_id).await?;

        let response = match result {
            Ok(response) => {
                Metrics::global().llm.record_call(true);
                info!(
                    task_id,
                    elapsed_ms = call_started.elapsed().as_millis() as u64,
                    stop_reason = ?response.stop_reason,
                    "LLM response"
                );
                gate.on_success(task_id).await?;
                response
            }
            Err(LlmError::Throttled(reason)) => {
                Metrics::global().llm.record_throttle();
                warn!(task_id, reason = %reason, "LLM call throttled");
                return match gate.on_throttled(task_id, record.last_usage, cancel).await {
                    Ok(()) => Ok(IterationOutcome::Throttled),
                    Err(_) => Ok(IterationOutcome::Cancelled),
                };
            }
            Err(e) => {
                Metrics::global().llm.record_call(false);
                let dump = dump_failed_request(&request);
                error!(task_id, error = %e, dump = ?dump, "LLM call failed");
                return Err(HiveError::Llm(e.to_string()));
            }
        };

        if let Some(usage) = response.usage {
            store.set_last_usage(task_id, usage).await?;
            debug!(
                task_id,
                input = usage.input_tokens,
                output = usage.output_tokens,
                "token usage"
            );
        }

        // 持久化 assistant 消息;编号以存储里最新的回合长度为准
        let fresh = store.load_conversation(task_id).await?;
        let number = fresh
            .get(current_turn_index)
            .map(|t| t.messages.len())
            .unwrap_or(0);
        let assistant = Message::assistant(response.content.clone(), number);
        store
            .append_message(task_id, current_turn_index, &assistant)
            .await?;

        store
            .publish_task_event(
                task_id,
                json!({
                    "type": "assistant_message",
                    "turn_number": current_turn_index,
                    "message_number": number,
                    "stop_reason": response.stop_reason,
                }),
            )
            .await?;

        match response.stop_reason {
            StopReason::ToolUse => {
                let tool_uses: Vec<ToolUseBlock> =
                    response.tool_uses().into_iter().cloned().collect();
                let ctx = ToolContext {
                    task_id: task_id.to_string(),
                    runtime: Arc::clone(&self.runtime),
                };
                self.runtime
                    .tools()
                    .dispatch(&ctx, &tool_uses, record.enable_recursion)
                    .await?;
                Ok(IterationOutcome::Completed { turn_ending: false })
            }
            // 截断:下一次迭代继续生成
            StopReason::MaxTokens => Ok(IterationOutcome::Completed { turn_ending: false }),
            _ => {
                info!(task_id, turn = current_turn_index, "turn ending, summarizing");
                self.summarize_turn(task_id, &record, current_turn_index, cancel)
                    .await?;
                store
                    .publish_task_event(
                        task_id,
                        json!({ "type": "turn_complete", "turn_number": current_turn_index }),
                    )
                    .await?;
                Ok(IterationOutcome::Completed { turn_ending: true })
            }
        }
    }

    /// 回合收束后的摘要调用:无工具、独立的系统提示词。
    /// 被限流或取消时放弃摘要(缺摘要不影响会话一致性);其余失败照常上抛。
    async fn summarize_turn(
        &self,
        task_id: &str,
        record: &TaskRecord,
        turn_index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), HiveError> {
        let store = self.runtime.store();
        let turns = store.load_conversation(task_id).await?;
        let Some(turn) = turns.get(turn_index) else {
            return Ok(());
        };
        let payload = serde_json::to_string_pretty(&turn.messages)?;

        let model_id = self
            .runtime
            .config()
            .llm
            .summarizer_model
            .clone()
            .unwrap_or_else(|| record.model_id.clone());
        let request = ModelRequest {
            model_id: model_id.clone(),
            system_prompt: SUMMARIZER_SYSTEM_PROMPT.to_string(),
            messages: vec![WireMessage {
                role: Role::User,
                content: vec![ContentBlock::text(format!(
                    "Summarize the work accomplished in this turn. Turn messages:\n\n{payload}"
                ))],
            }],
            tools: vec![],
        };

        let gate = self.runtime.throttles().gate(&model_id).await;
        if gate.pause_before_call(record.last_usage, cancel).await.is_err() {
            warn!(task_id, "turn summarization skipped: cancelled");
            return Ok(());
        }

        match self.runtime.llm().converse(&request).await {
            Ok(response) => {
                Metrics::global().llm.record_call(true);
                gate.on_success(task_id).await?;
                if let Some(summary) = response.first_text() {
                    store.set_turn_summary(task_id, turn_index, summary).await?;
                }
                Ok(())
            }
            Err(LlmError::Throttled(reason)) => {
                Metrics::global().llm.record_throttle();
                warn!(task_id, reason = %reason, "turn summarization throttled, leaving summary empty");
                let _ = gate.on_throttled(task_id, record.last_usage, cancel).await;
                Ok(())
            }
            Err(e) => {
                Metrics::global().llm.record_call(false);
                Err(HiveError::Llm(e.to_string()))
            }
        }
    }
}

/// 非限流失败时把请求体落盘供排障
fn dump_failed_request(request: &ModelRequest) -> Option<PathBuf> {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    let path = std::env::temp_dir().join(format!("hive_llm_error_{suffix}.json"));
    let body = serde_json::to_string(request).ok()?;
    std::fs::write(&path, body).ok()?;
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::runtime::LaunchOptions;

    async fn prepared_runtime(llm: Arc<ScriptedLlm>) -> (Arc<Runtime>, String) {
        let runtime = Runtime::new_with_llm(Default::default(), llm);
        runtime.install_default_tools();
        let (_, task_id) = runtime
            .launch(LaunchOptions {
                initial_messages: vec!["Hello".into()],
                start_worker: false,
                ..LaunchOptions::default()
            })
            .await
            .unwrap();
        (runtime, task_id)
    }

    #[tokio::test]
    async fn test_single_turn_iteration_summarizes_and_ends() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_response("standard", ScriptedLlm::text_response("Hi"));
        llm.push_response("standard", ScriptedLlm::text_response("greeting handled"));
        let (runtime, task_id) = prepared_runtime(llm).await;

        let engine = IterationEngine::new(Arc::clone(&runtime));
        let cancel = CancellationToken::new();
        let outcome = engine.run_iteration(&task_id, 0, 250, &cancel).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Completed { turn_ending: true });

        let turns = runtime.store().load_conversation(&task_id).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].messages.len(), 2);
        assert_eq!(turns[0].messages[0].joined_text(), "Hello");
        assert_eq!(turns[0].messages[1].joined_text(), "Hi");
        assert_eq!(turns[0].turn_summary.as_deref(), Some("greeting handled"));

        // 用量写回任务记录
        let record = runtime.store().require_record(&task_id).await.unwrap();
        assert_eq!(record.last_usage.output_tokens, 50);
    }

    #[tokio::test]
    async fn test_tool_use_iteration_queues_results_and_continues() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_response(
            "standard",
            ScriptedLlm::tool_use_response(
                "u1",
                "think",
                serde_json::json!({ "thoughts": "hmm", "conclusions": "proceed" }),
            ),
        );
        let (runtime, task_id) = prepared_runtime(llm).await;

        let engine = IterationEngine::new(Arc::clone(&runtime));
        let cancel = CancellationToken::new();
        let outcome = engine.run_iteration(&task_id, 0, 250, &cancel).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Completed { turn_ending: false });

        // assistant 的 tool_use 已持久化,结果在收件箱等待下一次 drain
        let turns = runtime.store().load_conversation(&task_id).await.unwrap();
        assert!(turns[0].messages[1].has_tool_use());
        assert_eq!(runtime.store().queue_len(&task_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_tokens_keeps_turn_open() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_response(
            "standard",
            crate::llm::ModelResponse {
                content: vec![ContentBlock::text("truncated...")],
                stop_reason: StopReason::MaxTokens,
                usage: None,
            },
        );
        let (runtime, task_id) = prepared_runtime(llm).await;

        let engine = IterationEngine::new(Arc::clone(&runtime));
        let cancel = CancellationToken::new();
        let outcome = engine.run_iteration(&task_id, 0, 250, &cancel).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Completed { turn_ending: false });

        let turns = runtime.store().load_conversation(&task_id).await.unwrap();
        assert!(turns[0].turn_summary.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_call_persists_nothing() {
        let llm = Arc::new(ScriptedLlm::new());
        let (runtime, task_id) = prepared_runtime(llm).await;

        // 先成功一次,让 last_request 有值,下一次 pause 必然进入等待
        let engine = IterationEngine::new(Arc::clone(&runtime));
        let cancel = CancellationToken::new();
        engine.run_iteration(&task_id, 0, 250, &cancel).await.unwrap();
        let before = runtime.store().load_conversation(&task_id).await.unwrap();

        runtime
            .enqueue(&task_id, crate::model::Envelope::user("more", None))
            .await
            .unwrap();
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let outcome = engine
            .run_iteration(&task_id, 1, 250, &cancelled)
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Cancelled);

        // 状态仍是 running(无 worker 收敛),drain 续写当前回合;没有新的 assistant 消息
        let after = runtime.store().load_conversation(&task_id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].messages.len(), before[0].messages.len() + 1);
        assert_eq!(after[0].messages.last().unwrap().role, Role::User);
    }
}
