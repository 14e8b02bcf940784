//! 工具箱
//!
//! 所有工具实现 Tool trait（name / description / input_schema / execute），
//! 由 ToolRegistry 按名注册与查找；ToolDispatcher 负责把 assistant 消息中的
//! tool_use 块转成收件箱里的 tool_result 信封，成功失败一律入队。

mod dispatcher;
mod query_task;
mod registry;
mod shell;
mod spawn_task;
mod think;

pub use dispatcher::ToolDispatcher;
pub use query_task::QueryTaskTool;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use shell::ShellTool;
pub use spawn_task::SpawnTaskTool;
pub use think::ThinkTool;
