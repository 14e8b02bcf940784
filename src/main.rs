//! headless 运行入口
//!
//! 用法：hive [task_id] [message...]
//! 给 message 时入队并启动 worker，等它让出后打印最终回复；
//! 只给 task_id 时唤醒既有任务。

use std::sync::Arc;

use anyhow::Result;

use hive::config::load_config;
use hive::llm::{ConverseHttpClient, LlmClient, ScriptedLlm};
use hive::model::final_assistant_text;
use hive::runtime::{LaunchOptions, Runtime};
use hive::store::{DocumentStore, MemoryStore, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    hive::observability::init();
    let config = load_config(None)?;

    let store = build_store(&config).await?;
    let llm = build_llm(&config);
    let runtime = Runtime::new(config, TaskStore::new(store), llm);
    runtime.install_default_tools();

    let mut args = std::env::args().skip(1);
    let task_id = args.next();
    let words: Vec<String> = args.collect();
    let initial_messages = if words.is_empty() {
        Vec::new()
    } else {
        vec![words.join(" ")]
    };

    let (worker_id, task_id) = runtime
        .launch(LaunchOptions {
            task_id,
            initial_messages,
            ..LaunchOptions::default()
        })
        .await?;

    match worker_id {
        None => {
            println!("Task {task_id} prepared; queue a message to start it.");
        }
        Some(worker_id) => {
            tracing::info!(task_id = %task_id, worker_id, "waiting for task to yield");
            runtime.wait_stopped(&task_id).await?;
            let turns = runtime.store().load_conversation(&task_id).await?;
            match final_assistant_text(&turns) {
                Some(text) => println!("[{task_id}]\n{text}"),
                None => println!("[{task_id}] no assistant response recorded"),
            }
        }
    }
    Ok(())
}

async fn build_store(config: &hive::config::AppConfig) -> Result<Arc<dyn DocumentStore>> {
    if let Some(path) = &config.store.sqlite_path {
        #[cfg(feature = "async-sqlite")]
        {
            return Ok(Arc::new(hive::store::SqliteStore::new(path).await?));
        }
        #[cfg(not(feature = "async-sqlite"))]
        tracing::warn!(
            path = %path.display(),
            "sqlite_path configured but the async-sqlite feature is disabled, using memory store"
        );
    }
    Ok(Arc::new(MemoryStore::new()))
}

fn build_llm(config: &hive::config::AppConfig) -> Arc<dyn LlmClient> {
    match &config.llm.base_url {
        Some(base_url) => {
            let api_key = std::env::var(&config.llm.api_key_env).ok();
            if api_key.is_none() {
                tracing::warn!(env = %config.llm.api_key_env, "API key env var not set");
            }
            Arc::new(ConverseHttpClient::new(
                base_url,
                api_key,
                config.llm.request_timeout_secs,
            ))
        }
        None => {
            tracing::warn!("no LLM base_url configured, using scripted mock");
            Arc::new(ScriptedLlm::new())
        }
    }
}
