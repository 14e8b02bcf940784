//! 存储适配层
//!
//! 面向 JSON 文档的共享存储：单文档原子操作（set / set_path / append / take_list）
//! 加发布订阅通道。核心只依赖两点：命名路径上的原子追加（返回新长度，调用方
//! 不得使用过期索引）与单字段原子写，从不依赖跨文档事务。
//!
//! 实现：MemoryStore（常驻）、SqliteStore（feature = "async-sqlite"，跨重启持久化）。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;
mod tasks;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
pub use tasks::TaskStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::error::HiveError;

/// 每个通道的广播缓冲条数；慢消费者丢最旧事件（事件只作通知，不承载状态）
const CHANNEL_CAPACITY: usize = 64;

/// 文档内路径段：对象字段或列表下标
#[derive(Clone, Debug, PartialEq)]
pub enum PathSeg {
    Field(String),
    Index(usize),
}

impl PathSeg {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }
}

/// 共享文档存储
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, HiveError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), HiveError>;

    async fn delete(&self, key: &str) -> Result<(), HiveError>;

    /// 原子写单个路径；路径中间节点必须已存在
    async fn set_path(&self, key: &str, path: &[PathSeg], value: Value)
        -> Result<(), HiveError>;

    /// 原子追加到路径处的列表并返回新长度。路径为空且文档缺失时惰性建列表。
    async fn append(&self, key: &str, path: &[PathSeg], value: Value)
        -> Result<usize, HiveError>;

    /// 原子取走整个列表并清空（drain 专用：取走前入队的信封全部可见且不丢失）
    async fn take_list(&self, key: &str) -> Result<Vec<Value>, HiveError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, HiveError>;

    async fn publish(&self, channel: &str, event: Value) -> Result<(), HiveError>;

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value>;
}

// ── 键与通道布局 ──

pub fn task_data_key(task_id: &str) -> String {
    format!("task_data:{task_id}")
}

pub fn conversation_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

pub fn queue_key(task_id: &str) -> String {
    format!("task_queue:{task_id}")
}

/// LLM 调用进行中的在场标记
pub fn api_call_key(task_id: &str) -> String {
    format!("task_api_call:{task_id}")
}

pub fn task_events_channel(task_id: &str) -> String {
    format!("task_events:{task_id}")
}

pub fn throttle_channel(model_id: &str) -> String {
    format!("throttle:{model_id}")
}

// ── 进程内发布订阅 ──

/// 两个存储实现共用的通道集线器
#[derive(Default)]
pub(crate) struct ChannelHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl ChannelHub {
    pub async fn publish(&self, channel: &str, event: Value) {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        // 无订阅者时发送失败，与 pub/sub 语义一致，忽略即可
        let _ = sender.send(event);
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

// ── 路径求值（实现共用） ──

/// 按路径取可变引用；任何一段缺失返回 None
pub(crate) fn resolve_path_mut<'a>(
    root: &'a mut Value,
    path: &[PathSeg],
) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in path {
        cur = match seg {
            PathSeg::Field(name) => cur.as_object_mut()?.get_mut(name.as_str())?,
            PathSeg::Index(i) => cur.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(cur)
}

/// 在文档中写入路径；最后一段允许新建对象字段，其余必须存在
pub(crate) fn write_path(
    doc: &mut Value,
    path: &[PathSeg],
    value: Value,
) -> Result<(), HiveError> {
    let Some((last, prefix)) = path.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = resolve_path_mut(doc, prefix)
        .ok_or_else(|| HiveError::Conversation(format!("path prefix missing: {prefix:?}")))?;
    match last {
        PathSeg::Field(name) => {
            let obj = parent
                .as_object_mut()
                .ok_or_else(|| HiveError::Conversation(format!("not an object at {prefix:?}")))?;
            obj.insert(name.clone(), value);
        }
        PathSeg::Index(i) => {
            let arr = parent
                .as_array_mut()
                .ok_or_else(|| HiveError::Conversation(format!("not a list at {prefix:?}")))?;
            let slot = arr
                .get_mut(*i)
                .ok_or_else(|| HiveError::Conversation(format!("index {i} out of bounds")))?;
            *slot = value;
        }
    }
    Ok(())
}

/// 在文档内路径处的列表追加，返回新长度
pub(crate) fn append_at_path(
    doc: &mut Value,
    path: &[PathSeg],
    value: Value,
) -> Result<usize, HiveError> {
    let target = resolve_path_mut(doc, path)
        .ok_or_else(|| HiveError::Conversation(format!("append path missing: {path:?}")))?;
    let arr = target
        .as_array_mut()
        .ok_or_else(|| HiveError::Conversation(format!("not a list at {path:?}")))?;
    arr.push(value);
    Ok(arr.len())
}
