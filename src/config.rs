//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖
//! （双下划线表示嵌套，如 `HIVE__LLM__DEFAULT_MODEL=fast`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub throttle: ThrottleSection,
    pub runner: RunnerSection,
    pub tools: ToolsSection,
    pub store: StoreSection,
}

/// [app] 段：应用名与工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// shell 工具的工作目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：Converse 风格端点与模型表
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 端点基地址；为空时退回脚本化 Mock（本地联调）
    pub base_url: Option<String>,
    /// API Key 所在环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// 摘要调用用的模型；为空时沿用任务模型
    #[serde(default)]
    pub summarizer_model: Option<String>,
    /// 模型短名 → 完整模型 id
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "HIVE_API_KEY".to_string()
}

fn default_model() -> String {
    "standard".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            summarizer_model: None,
            models: HashMap::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmSection {
    /// 模型短名解析：已是完整 id（或表中无此短名）时原样返回
    pub fn resolve_model(&self, name: &str) -> String {
        self.models
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// [throttle] 段：主动延时曲线与退避抖动（曲线是可调项，不是协议）
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleSection {
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,
    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: f64,
    #[serde(default = "default_backoff_jitter_min")]
    pub backoff_jitter_min_secs: f64,
    #[serde(default = "default_backoff_jitter_max")]
    pub backoff_jitter_max_secs: f64,
}

fn default_tokens_per_minute() -> u64 {
    200_000
}

fn default_min_delay_secs() -> f64 {
    0.3
}

fn default_backoff_jitter_min() -> f64 {
    20.0
}

fn default_backoff_jitter_max() -> f64 {
    30.0
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            tokens_per_minute: default_tokens_per_minute(),
            min_delay_secs: default_min_delay_secs(),
            backoff_jitter_min_secs: default_backoff_jitter_min(),
            backoff_jitter_max_secs: default_backoff_jitter_max(),
        }
    }
}

/// [runner] 段：worker 生命周期参数
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// 单个 worker 生命周期内的迭代上限
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// stop 的宽限窗口，超时后强杀
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_max_iterations() -> u32 {
    250
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// [tools] 段：工具超时与 shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "date".into(),
        "echo".into(),
    ]
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

/// [store] 段：持久化后端；路径为空时用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{name}.toml");
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.runner.max_iterations, 250);
        assert_eq!(cfg.throttle.tokens_per_minute, 200_000);
        assert!(cfg.llm.summarizer_model.is_none());
    }

    #[test]
    fn test_resolve_model_passthrough_and_table() {
        let mut cfg = LlmSection::default();
        cfg.models.insert("fast".into(), "vendor.fast-v2".into());
        assert_eq!(cfg.resolve_model("fast"), "vendor.fast-v2");
        assert_eq!(cfg.resolve_model("vendor.big-v1"), "vendor.big-v1");
    }
}
