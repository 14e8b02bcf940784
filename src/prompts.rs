//! 系统提示词构建
//!
//! 静态段在任务创建时固化进任务记录；动态段每次迭代重建
//! （日期、回合、token 用量，子任务附带父会话转写）。

use chrono::Utc;

use crate::model::{Role, TaskRecord, Turn};

/// 把会话转写成可读文本；include_tool_details 为 false 时工具调用折叠为一行
pub fn transcribe(turns: &[Turn], include_tool_details: bool) -> String {
    let mut lines: Vec<String> = Vec::new();

    for turn in turns {
        for message in &turn.messages {
            match message.role {
                Role::User => {
                    for block in &message.content {
                        if let Some(text) = block.as_text() {
                            lines.push(format!("User: {text}"));
                        } else if let Some(result) = block.as_tool_result() {
                            if include_tool_details {
                                let text = result
                                    .content
                                    .iter()
                                    .find_map(|b| b.as_text())
                                    .unwrap_or_default();
                                lines.push(format!("Tool Result ({}): {text}", result.id));
                            }
                        }
                    }
                }
                Role::Assistant => {
                    let text = message.joined_text();
                    if !text.is_empty() {
                        lines.push(format!("Assistant: {text}"));
                    }
                    for block in &message.content {
                        if let Some(tool_use) = block.as_tool_use() {
                            if include_tool_details {
                                let args = serde_json::to_string_pretty(&tool_use.input)
                                    .unwrap_or_default();
                                lines.push(format!("Tool Use: {}\n  Input: {args}", tool_use.name));
                            } else {
                                lines.push(format!("Assistant: [Used {} tool]", tool_use.name));
                            }
                        }
                    }
                }
            }
        }
    }

    if lines.is_empty() {
        "(empty conversation)".to_string()
    } else {
        lines.join("\n\n")
    }
}

/// 静态系统提示词：编排角色与任务层级行为准则
pub fn build_static_system_prompt(parent_task_id: Option<&str>) -> String {
    let mut base = String::from(
        "You are Hive, an orchestration agent.\n\n\
         CORE PRINCIPLES:\n\
         - Tool-driven: use tools to accomplish tasks, not descriptions of what could be done\n\
         - Minimal: keep responses concise\n\
         - Observable: all task state lives in the shared store\n\n\
         AVAILABLE TOOLS:\n\
         - shell: execute an allowlisted shell command (returns stdout, stderr, exit code)\n\
         - think: internal reasoning; thoughts are discarded, conclusions are kept\n\
         - spawn_task: spawn or resume child tasks for complex operations (returns task_id)\n\
         - query_task: passively query another task's status and conversation content\n\n",
    );

    match parent_task_id {
        None => base.push_str(
            "TASK HIERARCHY: you are the ROOT task.\n\n\
             Your context window is your most precious resource. When given real work, break it\n\
             into focused sub-tasks and delegate with spawn_task; each child runs in its own\n\
             context and reports back to you on completion. Use shell only for quick inspections\n\
             that inform delegation decisions. Coordinate and integrate; do not perform\n\
             multi-step work yourself.\n\n",
        ),
        Some(parent) => {
            base.push_str(&format!(
                "TASK HIERARCHY: you are a CHILD task. Parent task ID: {parent}\n\
                 You can inspect your parent's conversation with the query_task tool.\n\n\
                 Your mandate is focused and bounded: complete it thoroughly within scope, using\n\
                 tools directly. Spawn sub-tasks only when your mandate clearly splits into\n\
                 independent pieces that each need substantial work. When you finish, your final\n\
                 response is what your parent sees; make it a comprehensive report.\n\n",
            ));
        }
    }

    base
}

/// 动态系统提示词：当前上下文 + 可选的父会话转写
pub fn build_dynamic_system_prompt(
    record: &TaskRecord,
    turn_number: usize,
    parent_transcript: Option<&str>,
) -> String {
    let now = Utc::now();
    let usage = record.last_usage;
    let mut dynamic = format!(
        "\n=== CURRENT CONTEXT ===\n\
         Date: {}\n\
         Time: {}\n\
         Turn: {}\n\
         Tokens used: {} (input: {}, output: {})\n",
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S"),
        turn_number,
        usage.input_tokens + usage.output_tokens,
        usage.input_tokens,
        usage.output_tokens,
    );

    if let (Some(parent), Some(transcript)) = (&record.parent_task_id, parent_transcript) {
        dynamic.push_str(&format!(
            "\n=== PARENT TASK CONTEXT ===\n\
             You are a child task spawned to focus on a particular job. Below is a transcription\n\
             of the conversation your parent task ({parent}) had that led to you being spawned.\n\
             Use it to inform the full intent and context of the task you've been given.\n\n\
             {transcript}\n\n\
             === END PARENT CONTEXT ===\n",
        ));
    }

    dynamic
}

/// 迭代预算提示：临近上限时提醒模型收尾并汇报
pub fn iteration_notice(iteration: u32, max_iterations: u32) -> Option<String> {
    if max_iterations == 1 {
        Some(
            "[SYSTEM] This is a single-iteration task. You may either respond via text to your \
             parent task or perform one or more simultaneous tool uses, but you will not be able \
             to respond or do further work after tool use."
                .to_string(),
        )
    } else if max_iterations == 2 && iteration == 0 {
        Some(
            "[SYSTEM] This is a two-iteration task. Use this initial iteration to perform your \
             assigned work in one or more simultaneous tool calls, then use your second action \
             to report your results."
                .to_string(),
        )
    } else if max_iterations > 2 && max_iterations - iteration == 2 {
        Some(format!(
            "[SYSTEM] Warning: iteration {} of {}. Finish up your work, perform any final safety \
             or hygiene operations, and prepare to use your final iteration to report your \
             results - or to document failures, partial successes, and recommended next steps.",
            iteration + 1,
            max_iterations
        ))
    } else if iteration == max_iterations - 1 {
        Some(
            "[SYSTEM] Final iteration. Use this final operation to give the parent task your \
             detailed final report rather than using tools."
                .to_string(),
        )
    } else {
        None
    }
}
