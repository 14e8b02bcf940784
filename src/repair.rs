//! 会话修复
//!
//! 提交给 LLM 前的结构修复：回合内 user/assistant 严格交替、
//! 每个 tool_use 在紧随其后的 user 消息中有同 id 的 tool_result。
//! 修复是纯函数，产出仅用于提交的视图，从不改写存储中的会话。

use tracing::{debug, warn};

use crate::model::{ContentBlock, Message, Role, ToolResultBlock, Turn};

/// 中断的工具调用在合成结果中携带的错误说明
pub const INTERRUPTED_TOOL_MESSAGE: &str = "Tool execution interrupted or failed to complete";

/// 对整个会话逐回合修复，返回满足线上协议约束的视图
pub fn repair_turns(turns: &[Turn]) -> Vec<Turn> {
    turns.iter().map(repair_turn).collect()
}

fn synthetic_results_message(
    pending: &[String],
    number: usize,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Message {
    let content = pending
        .iter()
        .map(|id| ContentBlock::ToolResult(ToolResultBlock::error(id, INTERRUPTED_TOOL_MESSAGE)))
        .collect();
    Message {
        role: Role::User,
        content,
        message_number: number,
        timestamp,
    }
}

fn repair_turn(turn: &Turn) -> Turn {
    let mut out: Vec<Message> = Vec::with_capacity(turn.messages.len());
    // 最近一条 assistant 消息发出的、尚未配对的 tool_use id
    let mut pending: Vec<String> = Vec::new();
    let mut last_role: Option<Role> = None;

    for msg in &turn.messages {
        match msg.role {
            Role::Assistant => {
                if last_role == Some(Role::Assistant) && !pending.is_empty() {
                    // 连续 assistant 且前一条有未配对的工具调用：插入合成结果
                    debug!(
                        turn = turn.turn_number,
                        pending = pending.len(),
                        "inserting synthetic tool results for interrupted tool use"
                    );
                    out.push(synthetic_results_message(&pending, 0, msg.timestamp));
                    pending.clear();
                }
                pending = msg.tool_use_ids();
                out.push(msg.clone());
                last_role = Some(Role::Assistant);
            }
            Role::User => {
                let mut content: Vec<ContentBlock> = Vec::with_capacity(msg.content.len());
                for block in &msg.content {
                    match block {
                        ContentBlock::ToolResult(result) => {
                            if let Some(pos) = pending.iter().position(|id| id == &result.id) {
                                pending.remove(pos);
                                content.push(block.clone());
                            } else {
                                // 已被消费或来历不明的结果块，丢弃以保持配对约束
                                debug!(id = %result.id, "dropping unmatched tool result block");
                            }
                        }
                        other => content.push(other.clone()),
                    }
                }
                // 仍未配对的 id 补合成错误结果到同一条 user 消息
                for id in pending.drain(..) {
                    content.push(ContentBlock::ToolResult(ToolResultBlock::error(
                        &id,
                        INTERRUPTED_TOOL_MESSAGE,
                    )));
                }
                if content.is_empty() {
                    // 所有块都被去重掉的空消息不提交
                    continue;
                }
                out.push(Message {
                    role: Role::User,
                    content,
                    message_number: msg.message_number,
                    timestamp: msg.timestamp,
                });
                last_role = Some(Role::User);
            }
        }
    }

    // 回合以未配对的 tool_use 收尾（进程在结果入队前被杀）：
    // 提交视图补一条合成结果消息，存储中的会话不动
    if !pending.is_empty() {
        if out.last().is_some_and(|m| m.role == Role::User) {
            warn!(turn = turn.turn_number, "pending tool ids after trailing user message");
        }
        let ts = out.last().map(|m| m.timestamp).unwrap_or(turn.started_at);
        out.push(synthetic_results_message(&pending, 0, ts));
    }

    // 重新编号，保证序号与下标一致
    for (n, msg) in out.iter_mut().enumerate() {
        msg.message_number = n;
    }

    Turn {
        turn_number: turn.turn_number,
        started_at: turn.started_at,
        messages: out,
        turn_summary: turn.turn_summary.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolUseBlock;
    use serde_json::json;

    fn user_text(text: &str, n: usize) -> Message {
        Message::user(vec![ContentBlock::text(text)], n)
    }

    fn assistant_tool_use(id: &str, n: usize) -> Message {
        Message::assistant(
            vec![ContentBlock::ToolUse(ToolUseBlock {
                id: id.into(),
                name: "clock".into(),
                input: json!({}),
            })],
            n,
        )
    }

    fn user_tool_result(id: &str, n: usize) -> Message {
        Message::user(
            vec![ContentBlock::ToolResult(ToolResultBlock::success(id, "{}"))],
            n,
        )
    }

    fn turn_with(messages: Vec<Message>) -> Turn {
        let mut turn = Turn::new(0);
        turn.messages = messages;
        turn
    }

    #[test]
    fn test_well_formed_turn_is_untouched() {
        let turn = turn_with(vec![
            user_text("what time is it", 0),
            assistant_tool_use("u1", 1),
            user_tool_result("u1", 2),
            Message::assistant(vec![ContentBlock::text("noon")], 3),
        ]);
        let repaired = repair_turns(std::slice::from_ref(&turn));
        assert_eq!(repaired[0].messages.len(), 4);
        assert_eq!(repaired[0], turn);
    }

    #[test]
    fn test_consecutive_assistants_get_synthetic_results() {
        let turn = turn_with(vec![
            user_text("go", 0),
            assistant_tool_use("u1", 1),
            Message::assistant(vec![ContentBlock::text("moving on")], 2),
        ]);
        let repaired = repair_turn(&turn);

        assert_eq!(repaired.messages.len(), 4);
        let synthetic = &repaired.messages[2];
        assert_eq!(synthetic.role, Role::User);
        let result = synthetic.content[0].as_tool_result().unwrap();
        assert_eq!(result.id, "u1");
        assert!(result.is_error());
        let payload: serde_json::Value =
            serde_json::from_str(result.content[0].as_text().unwrap()).unwrap();
        assert_eq!(payload["error"], INTERRUPTED_TOOL_MESSAGE);
    }

    #[test]
    fn test_consecutive_assistants_without_tool_use_pass_through() {
        // max_tokens 续写产生的连续 assistant 文本：无待配对 id，不插合成消息
        let turn = turn_with(vec![
            user_text("go", 0),
            Message::assistant(vec![ContentBlock::text("part one")], 1),
            Message::assistant(vec![ContentBlock::text("part two")], 2),
        ]);
        let repaired = repair_turn(&turn);
        assert_eq!(repaired.messages.len(), 3);
    }

    #[test]
    fn test_missing_result_appended_to_following_user_message() {
        // 工具结果丢失，后续 user 文本消息里补合成错误结果
        let turn = turn_with(vec![
            user_text("go", 0),
            assistant_tool_use("u1", 1),
            user_text("are you still there?", 2),
        ]);
        let repaired = repair_turn(&turn);

        assert_eq!(repaired.messages.len(), 3);
        let patched = &repaired.messages[2];
        assert_eq!(patched.role, Role::User);
        assert!(patched.content.iter().any(|b| b.as_text().is_some()));
        let result = patched
            .content
            .iter()
            .find_map(|b| b.as_tool_result())
            .unwrap();
        assert_eq!(result.id, "u1");
        assert!(result.is_error());
    }

    #[test]
    fn test_trailing_tool_use_gets_synthetic_closure() {
        // 进程在工具结果入队前被杀：提交视图必须以配对的 user 消息收尾
        let turn = turn_with(vec![user_text("go", 0), assistant_tool_use("u1", 1)]);
        let repaired = repair_turn(&turn);

        assert_eq!(repaired.messages.len(), 3);
        let tail = repaired.messages.last().unwrap();
        assert_eq!(tail.role, Role::User);
        assert_eq!(tail.content[0].as_tool_result().unwrap().id, "u1");
    }

    #[test]
    fn test_duplicate_tool_results_are_dropped() {
        let turn = turn_with(vec![
            user_text("go", 0),
            assistant_tool_use("u1", 1),
            user_tool_result("u1", 2),
            user_tool_result("u1", 3),
            Message::assistant(vec![ContentBlock::text("ok")], 4),
        ]);
        let repaired = repair_turn(&turn);

        // 重复的结果消息被整条去掉（内容为空不提交）
        let result_count = repaired
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|b| b.as_tool_result().is_some())
            .count();
        assert_eq!(result_count, 1);
    }

    #[test]
    fn test_repair_is_pure() {
        let turn = turn_with(vec![user_text("go", 0), assistant_tool_use("u1", 1)]);
        let before = turn.clone();
        let _ = repair_turns(std::slice::from_ref(&turn));
        assert_eq!(turn, before);
    }

    #[test]
    fn test_renumbering_matches_position() {
        let turn = turn_with(vec![
            user_text("go", 7),
            assistant_tool_use("u1", 9),
            Message::assistant(vec![ContentBlock::text("done")], 11),
        ]);
        let repaired = repair_turn(&turn);
        for (n, msg) in repaired.messages.iter().enumerate() {
            assert_eq!(msg.message_number, n);
        }
    }
}
