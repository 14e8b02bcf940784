//! 任务记录：每个任务的控制块
//!
//! 会话是持久的事实来源，任务记录只承载控制状态（状态、worker、模型、迭代上限等）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态：running ⇔ 记录中的 worker_id 指向本编排器内存活的 worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Stopped,
}

/// 最近一次 LLM 调用的 token 用量（线上字段为 camelCase）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "inputTokens", default)]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens", default)]
    pub output_tokens: u64,
    #[serde(rename = "totalTokens", default)]
    pub total_tokens: u64,
}

/// 任务记录（`task_data:{id}` 文档）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    pub model_id: String,
    pub static_system_prompt: String,
    pub enable_recursion: bool,
    pub status: TaskStatus,
    /// worker 存活时为其注册表 id，停止后清空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub process_started_at: DateTime<Utc>,
    pub max_iterations: u32,
    #[serde(default)]
    pub last_usage: TokenUsage,
    /// 子任务 id 列表，仅供查看，不参与控制流
    #[serde(default)]
    pub children: Vec<String>,
}

impl TaskRecord {
    pub fn is_child(&self) -> bool {
        self.parent_task_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_wire_names_are_camel_case() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
        };
        let v = serde_json::to_value(usage).unwrap();
        assert_eq!(
            v,
            serde_json::json!({ "inputTokens": 10, "outputTokens": 20, "totalTokens": 30 })
        );
    }

    #[test]
    fn test_record_roundtrip_without_worker() {
        let record = TaskRecord {
            task_id: "conversation_abc123".into(),
            parent_task_id: None,
            model_id: "standard".into(),
            static_system_prompt: "prompt".into(),
            enable_recursion: true,
            status: TaskStatus::Stopped,
            worker_id: None,
            created_at: Utc::now(),
            process_started_at: Utc::now(),
            max_iterations: 250,
            last_usage: TokenUsage::default(),
            children: vec![],
        };
        let v = serde_json::to_value(&record).unwrap();
        assert!(v.get("worker_id").is_none());
        let back: TaskRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back.status, TaskStatus::Stopped);
        assert!(!back.is_child());
    }
}
