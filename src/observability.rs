//! 可观测性
//!
//! tracing 初始化与全局指标：LLM 调用次数 / 失败 / 限流、工具执行次数与失败。

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().expect("directive")))
        .with(fmt::layer())
        .init();
}

/// LLM 调用指标
#[derive(Debug, Default)]
pub struct LlmMetrics {
    pub total_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub throttled_calls: AtomicU64,
}

impl LlmMetrics {
    pub fn record_call(&self, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_throttle(&self) {
        self.throttled_calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// 工具执行指标
#[derive(Debug, Default)]
pub struct ToolMetrics {
    pub total_executions: AtomicU64,
    pub failed_executions: AtomicU64,
}

impl ToolMetrics {
    pub fn record_execution(&self, success: bool) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub llm: LlmMetrics,
    pub tools: ToolMetrics,
}

impl Metrics {
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::default)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "total_calls": self.llm.total_calls.load(Ordering::Relaxed),
                "failed_calls": self.llm.failed_calls.load(Ordering::Relaxed),
                "throttled_calls": self.llm.throttled_calls.load(Ordering::Relaxed),
            },
            "tools": {
                "total_executions": self.tools.total_executions.load(Ordering::Relaxed),
                "failed_executions": self.tools.failed_executions.load(Ordering::Relaxed),
            },
        })
    }
}
