//! 内存存储
//!
//! RwLock<HashMap> 上的全量实现；写操作持写锁即单文档原子。
//! 测试与单机内嵌部署使用；持久化场景换 SqliteStore。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::error::HiveError;

use super::{append_at_path, write_path, ChannelHub, DocumentStore, PathSeg};

/// 进程内文档存储
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Value>>,
    hub: ChannelHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, HiveError> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), HiveError> {
        self.docs.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HiveError> {
        self.docs.write().await.remove(key);
        Ok(())
    }

    async fn set_path(
        &self,
        key: &str,
        path: &[PathSeg],
        value: Value,
    ) -> Result<(), HiveError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(key)
            .ok_or_else(|| HiveError::TaskNotFound(key.to_string()))?;
        write_path(doc, path, value)
    }

    async fn append(
        &self,
        key: &str,
        path: &[PathSeg],
        value: Value,
    ) -> Result<usize, HiveError> {
        let mut docs = self.docs.write().await;
        if path.is_empty() {
            let doc = docs
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            return append_at_path(doc, path, value);
        }
        let doc = docs
            .get_mut(key)
            .ok_or_else(|| HiveError::TaskNotFound(key.to_string()))?;
        append_at_path(doc, path, value)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<Value>, HiveError> {
        let mut docs = self.docs.write().await;
        match docs.remove(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(other) => {
                // 类型不符时放回原值，调用方按结构错误处理
                docs.insert(key.to_string(), other);
                Err(HiveError::Conversation(format!("{key} is not a list")))
            }
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, HiveError> {
        Ok(self
            .docs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, event: Value) -> Result<(), HiveError> {
        self.hub.publish(channel, event).await;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.hub.subscribe(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_lazily_creates_list() {
        let store = MemoryStore::new();
        let len = store
            .append("task_queue:t1", &[], serde_json::json!({ "kind": "user" }))
            .await
            .unwrap();
        assert_eq!(len, 1);
        let len = store
            .append("task_queue:t1", &[], serde_json::json!({ "kind": "user" }))
            .await
            .unwrap();
        assert_eq!(len, 2);
    }

    #[tokio::test]
    async fn test_take_list_clears_atomically() {
        let store = MemoryStore::new();
        store
            .append("task_queue:t1", &[], serde_json::json!(1))
            .await
            .unwrap();
        store
            .append("task_queue:t1", &[], serde_json::json!(2))
            .await
            .unwrap();

        let taken = store.take_list("task_queue:t1").await.unwrap();
        assert_eq!(taken.len(), 2);
        assert!(store.take_list("task_queue:t1").await.unwrap().is_empty());
        assert!(store.get("task_queue:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_path_on_nested_document() {
        let store = MemoryStore::new();
        store
            .set("task_data:t1", serde_json::json!({ "status": "running" }))
            .await
            .unwrap();
        store
            .set_path(
                "task_data:t1",
                &[PathSeg::field("status")],
                serde_json::json!("stopped"),
            )
            .await
            .unwrap();
        let doc = store.get("task_data:t1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "stopped");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("task_events:t1").await;
        store
            .publish("task_events:t1", serde_json::json!({ "type": "process_ended" }))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "process_ended");
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("task_data:a", serde_json::json!({})).await.unwrap();
        store.set("task_data:b", serde_json::json!({})).await.unwrap();
        store.set("task:a", serde_json::json!([])).await.unwrap();
        let mut keys = store.list_keys("task_data:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["task_data:a", "task_data:b"]);
    }
}
