//! SQLite 持久化存储（feature = "async-sqlite"）
//!
//! 文档整体存为一行 JSON 文本；读改写包在单个事务中，满足单文档原子性。
//! 发布订阅仍走进程内通道：单进程部署下事件不需要跨进程。

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use std::path::Path;
use tokio::sync::broadcast;

use crate::error::HiveError;

use super::{append_at_path, write_path, ChannelHub, DocumentStore, PathSeg};

/// SQLite 文档存储
pub struct SqliteStore {
    pool: sqlx::sqlite::SqlitePool,
    hub: ChannelHub,
}

fn db_err(e: sqlx::Error) -> HiveError {
    HiveError::StoreUnavailable(e.to_string())
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;

        Ok(Self {
            pool,
            hub: ChannelHub::default(),
        })
    }

    async fn read_doc(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &str,
    ) -> Result<Option<Value>, HiveError> {
        let row = sqlx::query("SELECT body FROM documents WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
        }
    }

    async fn write_doc(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &str,
        doc: &Value,
    ) -> Result<(), HiveError> {
        sqlx::query("INSERT OR REPLACE INTO documents (key, body) VALUES (?, ?)")
            .bind(key)
            .bind(doc.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, HiveError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let doc = Self::read_doc(&mut tx, key).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(doc)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), HiveError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::write_doc(&mut tx, key, &value).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn delete(&self, key: &str) -> Result<(), HiveError> {
        sqlx::query("DELETE FROM documents WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_path(
        &self,
        key: &str,
        path: &[PathSeg],
        value: Value,
    ) -> Result<(), HiveError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut doc = Self::read_doc(&mut tx, key)
            .await?
            .ok_or_else(|| HiveError::TaskNotFound(key.to_string()))?;
        write_path(&mut doc, path, value)?;
        Self::write_doc(&mut tx, key, &doc).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn append(
        &self,
        key: &str,
        path: &[PathSeg],
        value: Value,
    ) -> Result<usize, HiveError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut doc = match Self::read_doc(&mut tx, key).await? {
            Some(doc) => doc,
            None if path.is_empty() => Value::Array(Vec::new()),
            None => return Err(HiveError::TaskNotFound(key.to_string())),
        };
        let len = append_at_path(&mut doc, path, value)?;
        Self::write_doc(&mut tx, key, &doc).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(len)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<Value>, HiveError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let doc = Self::read_doc(&mut tx, key).await?;
        let items = match doc {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                sqlx::query("DELETE FROM documents WHERE key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                items
            }
            Some(_) => return Err(HiveError::Conversation(format!("{key} is not a list"))),
        };
        tx.commit().await.map_err(db_err)?;
        Ok(items)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, HiveError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query("SELECT key FROM documents WHERE key LIKE ? ESCAPE '\\'")
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
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
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hive.db");

        {
            let store = SqliteStore::new(&path).await.unwrap();
            store
                .set("task_data:t1", serde_json::json!({ "status": "stopped" }))
                .await
                .unwrap();
            store
                .append("task_queue:t1", &[], serde_json::json!({ "kind": "user" }))
                .await
                .unwrap();
        }

        let store = SqliteStore::new(&path).await.unwrap();
        let doc = store.get("task_data:t1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "stopped");
        assert_eq!(store.take_list("task_queue:t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_returns_growing_length() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("hive.db")).await.unwrap();
        store
            .set("task:t1", serde_json::json!([ { "messages": [] } ]))
            .await
            .unwrap();
        let path = [PathSeg::Index(0), PathSeg::field("messages")];
        assert_eq!(
            store.append("task:t1", &path, serde_json::json!("a")).await.unwrap(),
            1
        );
        assert_eq!(
            store.append("task:t1", &path, serde_json::json!("b")).await.unwrap(),
            2
        );
    }
}
