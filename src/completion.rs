//! 完成传播
//!
//! 子任务回合收束后向父任务通报：拼完成消息（回合数、工具迭代数、最终回复）、
//! 入队为 completion 信封，父任务不在线则唤醒。决策矩阵保证并发通报幂等：
//! 最坏情况是第二次 launch 走 resume 分支，只入队不再 spawn。

use std::sync::Arc;

use tracing::info;

use crate::error::HiveError;
use crate::model::{final_assistant_text, Envelope, Role, Turn};
use crate::runtime::{LaunchOptions, Runtime};

/// 拼给父任务的完成通报文本
pub fn build_completion_message(child_task_id: &str, turns: &[Turn]) -> String {
    let total_turns = turns.len();
    let mut tool_iterations = 0usize;
    for turn in turns {
        for (i, message) in turn.messages.iter().enumerate() {
            if message.role == Role::Assistant {
                if let Some(next) = turn.messages.get(i + 1) {
                    if next.role == Role::User
                        && next.content.iter().any(|b| b.as_tool_result().is_some())
                    {
                        tool_iterations += 1;
                    }
                }
            }
        }
    }
    let final_text = final_assistant_text(turns).unwrap_or_default();

    format!(
        "[SYSTEM] Child task {child_task_id} has completed successfully. \
         Ran {total_turns} turns with {tool_iterations} tool iterations. \
         You can continue the conversation by calling spawn_task with \
         task_id='{child_task_id}' and a new message.\n\n\
         Final response from child:\n{final_text}"
    )
}

/// 回合收束后调用：无父任务则直接返回
///
/// 显式装箱返回类型（而非 `async fn`）：本函数经 launch → spawn_worker →
/// run_worker 间接递归调用自身，裸 `impl Future` 会让编译器在求解 Send 时
/// 陷入自引用循环；装箱后该类型对调用方是具名、非透明的，循环随之断开。
pub fn notify_parent_of_completion<'a>(
    runtime: &'a Arc<Runtime>,
    task_id: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HiveError>> + Send + 'a>> {
    Box::pin(async move {
        let store = runtime.store();
        let record = store.require_record(task_id).await?;
        let Some(parent_task_id) = record.parent_task_id.clone() else {
            return Ok(());
        };

        let turns = store.load_conversation(task_id).await?;
        let message = build_completion_message(task_id, &turns);
        info!(task_id, parent = %parent_task_id, "notifying parent of completion");

        runtime
            .enqueue(
                &parent_task_id,
                Envelope::completion(message, Some(task_id.to_string())),
            )
            .await?;

        // 父任务在线:其下一次迭代会 drain 到通报;离线则唤醒
        let activity = runtime.probe(&parent_task_id).await?;
        if !activity.alive {
            runtime
                .launch(LaunchOptions {
                    task_id: Some(parent_task_id),
                    ..LaunchOptions::default()
                })
                .await?;
        }
        Ok(())
    })
}
