//! 运行时
//!
//! Runtime 是共享句柄：配置、存储、LLM 客户端、节流注册表、worker 注册表与
//! 工具分发器。任务即协作式 worker（tokio 任务），由注册表提供
//! 等价于进程号的身份与按身份停止的能力。

mod lifecycle;
mod probe;
mod registry;
mod worker;

pub use lifecycle::LaunchOptions;
pub use probe::TaskActivity;
pub use registry::WorkerRegistry;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use crate::config::AppConfig;
use crate::error::HiveError;
use crate::ingest::Ingester;
use crate::llm::{LlmClient, ScriptedLlm};
use crate::model::Envelope;
use crate::store::{MemoryStore, TaskStore};
use crate::throttle::ThrottleRegistry;
use crate::tools::{
    QueryTaskTool, ShellTool, SpawnTaskTool, ThinkTool, ToolDispatcher, ToolRegistry,
};

/// 编排器运行时句柄
pub struct Runtime {
    config: AppConfig,
    store: TaskStore,
    llm: Arc<dyn LlmClient>,
    ingester: Ingester,
    throttles: ThrottleRegistry,
    workers: WorkerRegistry,
    tools: RwLock<Arc<ToolDispatcher>>,
}

impl Runtime {
    pub fn new(config: AppConfig, store: TaskStore, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        let ingester = Ingester::new(store.clone());
        let throttles = ThrottleRegistry::new(store.clone(), config.throttle.clone());
        let tools = RwLock::new(Arc::new(ToolDispatcher::new(
            ToolRegistry::new(),
            config.tools.tool_timeout_secs,
        )));
        Arc::new(Self {
            config,
            store,
            llm,
            ingester,
            throttles,
            workers: WorkerRegistry::new(),
            tools,
        })
    }

    /// 内存存储 + 脚本化 LLM（测试与本地联调）
    pub fn new_in_memory(config: AppConfig) -> Arc<Self> {
        Self::new_with_llm(config, Arc::new(ScriptedLlm::new()))
    }

    pub fn new_with_llm(config: AppConfig, llm: Arc<dyn LlmClient>) -> Arc<Self> {
        Self::new(config, TaskStore::new(Arc::new(MemoryStore::new())), llm)
    }

    /// 替换工具分发器（启动时装配一次）
    pub fn install_tools(&self, dispatcher: ToolDispatcher) {
        let mut names = dispatcher.tool_names();
        names.sort();
        info!(tools = ?names, "tool dispatcher installed");
        *self.tools.write().expect("tools lock") = Arc::new(dispatcher);
    }

    /// 注册默认工具箱：think / shell / spawn_task / query_task
    pub fn install_default_tools(self: &Arc<Self>) {
        let mut registry = ToolRegistry::new();
        registry.register(ThinkTool);
        registry.register(ShellTool::new(
            self.config.tools.allowed_commands.clone(),
            self.config.app.workspace_root.clone(),
        ));
        registry.register(SpawnTaskTool);
        registry.register(QueryTaskTool);
        self.install_tools(ToolDispatcher::new(
            registry,
            self.config.tools.tool_timeout_secs,
        ));
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn ingester(&self) -> &Ingester {
        &self.ingester
    }

    pub fn throttles(&self) -> &ThrottleRegistry {
        &self.throttles
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn tools(&self) -> Arc<ToolDispatcher> {
        Arc::clone(&self.tools.read().expect("tools lock"))
    }

    /// 生产者入口：向任务收件箱投递信封
    pub async fn enqueue(&self, task_id: &str, envelope: Envelope) -> Result<(), HiveError> {
        self.ingester.enqueue(task_id, envelope).await
    }

    /// 轮询等待任务 worker 退出（CLI 与测试用）
    pub async fn wait_stopped(&self, task_id: &str) -> Result<(), HiveError> {
        loop {
            let activity = self.probe(task_id).await?;
            if !activity.alive {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
