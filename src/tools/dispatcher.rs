//! 工具分发
//!
//! 逐个执行 assistant 消息里的 tool_use 块：带超时调用注册表中的工具，
//! 把成功值或错误一律转成 tool_result 信封入队；任何异常都不得逃出分发器，
//! 否则会话会留下无配对的 tool_use。

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::HiveError;
use crate::llm::ToolSpec;
use crate::model::{Envelope, ToolResultBlock, ToolUseBlock};
use crate::observability::Metrics;

use super::{ToolContext, ToolRegistry};

/// 工具分发器：持有注册表与统一超时
pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn specs(&self, enable_recursion: bool) -> Vec<ToolSpec> {
        self.registry.specs(enable_recursion)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行全部 tool_use 块并把结果入队，返回入队的结果条数
    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        tool_uses: &[ToolUseBlock],
        enable_recursion: bool,
    ) -> Result<usize, HiveError> {
        let ingester = ctx.runtime.ingester();
        let mut queued = 0usize;

        for tool_use in tool_uses {
            let result = self.run_one(ctx, tool_use, enable_recursion).await;
            let block = match result {
                Ok(value) => ToolResultBlock::success(&tool_use.id, value.to_string()),
                Err(message) => {
                    warn!(task_id = %ctx.task_id, tool = %tool_use.name, error = %message, "tool failed");
                    ToolResultBlock::error(&tool_use.id, &message)
                }
            };
            ingester
                .enqueue(
                    &ctx.task_id,
                    Envelope::tool_result(block, Some(ctx.task_id.clone())),
                )
                .await?;
            queued += 1;
        }

        Ok(queued)
    }

    async fn run_one(
        &self,
        ctx: &ToolContext,
        tool_use: &ToolUseBlock,
        enable_recursion: bool,
    ) -> Result<serde_json::Value, String> {
        if tool_use.name == "spawn_task" && !enable_recursion {
            return Err("spawn_task is disabled for this task".to_string());
        }
        let Some(tool) = self.registry.get(&tool_use.name) else {
            return Err(format!("Unknown tool: {}", tool_use.name));
        };

        let start = Instant::now();
        let result = timeout(
            self.timeout,
            tool.execute(tool_use.input.clone(), ctx),
        )
        .await;

        let (outcome, success) = match &result {
            Ok(Ok(_)) => ("ok", true),
            Ok(Err(_)) => ("error", false),
            Err(_) => ("timeout", false),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        Metrics::global().tools.record_execution(success);

        let audit = json!({
            "event": "tool_audit",
            "task_id": ctx.task_id,
            "tool": tool_use.name,
            "tool_use_id": tool_use.id,
            "outcome": outcome,
            "duration_ms": duration_ms,
        });
        info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(format!(
                "Tool {} timed out after {}s",
                tool_use.name,
                self.timeout.as_secs()
            )),
        }
    }
}
