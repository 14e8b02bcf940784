//! 错误类型
//!
//! 按故障类别划分：限流（可恢复）、取消（协作式）、存储不可用（致命）、
//! 工具失败（转为 error tool_result，不致命）等，供各组件统一传播。

use thiserror::Error;

/// 编排器运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    /// 存储不可达；调用方按致命处理，等待监督者重启
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// LLM 传输/服务端错误（非限流类），当次迭代失败
    #[error("LLM error: {0}")]
    Llm(String),

    /// 限流：由 ThrottleGate 退避后，迭代引擎决定是否重入
    #[error("LLM request throttled")]
    Throttled,

    /// 任务被外部 stop，协作式取消
    #[error("Cancelled")]
    Cancelled,

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 会话结构违反约束且无法修复
    #[error("Conversation invariant breach: {0}")]
    Conversation(String),
}
