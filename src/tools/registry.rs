//! 工具注册表
//!
//! 按名称存储 Arc<dyn Tool>；specs() 生成提供给模型的工具声明列表。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;
use crate::runtime::Runtime;

/// 工具执行上下文：调用方任务 id 与运行时句柄（spawn / query 类工具需要）
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub runtime: Arc<Runtime>,
}

/// 工具 trait：名称、描述与输入 schema 供模型选择，execute 收 JSON 参数
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String>;
}

/// 工具注册表
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 生成提供给模型的声明；enable_recursion 为 false 时隐藏 spawn_task
    pub fn specs(&self, enable_recursion: bool) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| enable_recursion || t.name() != "spawn_task")
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}
