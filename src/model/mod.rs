//! 数据模型
//!
//! 三类文档（任务记录 / 会话 / 收件箱）与线上内容块的封闭和类型。
//! 内容块序列化为 Converse 风格的外部标签形式（{"text"} / {"tool_use"} / {"tool_result"}）。

mod conversation;
mod envelope;
mod task;

pub use conversation::{
    final_assistant_text, ContentBlock, Message, Role, ToolResultBlock, ToolResultStatus,
    ToolUseBlock, Turn, WireMessage,
};
pub use envelope::{Envelope, EnvelopeBody};
pub use task::{TaskRecord, TaskStatus, TokenUsage};
