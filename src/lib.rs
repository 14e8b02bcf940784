//! Hive - 多智能体任务编排器
//!
//! LLM 驱动的会话式任务：持久会话、共享文档存储（键值 + 发布订阅）、
//! 协作式 worker 与父子任务委派。模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **model**: 任务记录 / 会话 / 信封的封闭和类型
//! - **store**: 文档存储适配（内存 / SQLite）与类型化任务访问
//! - **ingest**: 收件箱合入（回合边界与分组规则）
//! - **repair**: 提交前的会话结构修复
//! - **throttle**: 同模型共享的乘性退避协调
//! - **llm**: Converse 风格客户端抽象（HTTP / 脚本化 Mock）
//! - **engine**: 单次迭代（调用、工具分发、回合收束与摘要）
//! - **runtime**: worker 注册表、存活探测、任务生命周期
//! - **completion**: 子任务完成向父任务的传播
//! - **tools**: 工具箱（think / shell / spawn_task / query_task）与分发器
//! - **prompts**: 系统提示词与会话转写
//! - **observability**: tracing 初始化与全局指标

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod model;
pub mod observability;
pub mod prompts;
pub mod repair;
pub mod runtime;
pub mod store;
pub mod throttle;
pub mod tools;
