//! worker 注册表
//!
//! 为每个存活的任务 worker 维护等价于进程号的身份：id、取消令牌与
//! JoinHandle。存活判定依据 JoinHandle；按 id 取消 / 强杀支持外部 stop。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct WorkerEntry {
    cancel: CancellationToken,
    /// 注册先于 spawn 完成，join 在 attach 时补上；缺失视为启动中（存活）
    join: Option<JoinHandle<()>>,
}

/// worker 注册表
#[derive(Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    workers: RwLock<HashMap<u64, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 登记 worker（spawn 之前调用，避免探活窗口）
    pub async fn register(&self, worker_id: u64, cancel: CancellationToken) {
        self.workers
            .write()
            .await
            .insert(worker_id, WorkerEntry { cancel, join: None });
    }

    pub async fn attach(&self, worker_id: u64, join: JoinHandle<()>) {
        if let Some(entry) = self.workers.write().await.get_mut(&worker_id) {
            entry.join = Some(join);
        }
    }

    pub async fn is_alive(&self, worker_id: u64) -> bool {
        match self.workers.read().await.get(&worker_id) {
            None => false,
            Some(entry) => entry.join.as_ref().map(|j| !j.is_finished()).unwrap_or(true),
        }
    }

    /// 触发协作式取消；worker 不存在时返回 false
    pub async fn cancel(&self, worker_id: u64) -> bool {
        match self.workers.read().await.get(&worker_id) {
            None => false,
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
        }
    }

    /// 强杀（宽限期后仍未退出时）
    pub async fn abort(&self, worker_id: u64) {
        if let Some(entry) = self.workers.read().await.get(&worker_id) {
            if let Some(join) = &entry.join {
                join.abort();
            }
        }
    }

    pub async fn remove(&self, worker_id: u64) {
        self.workers.write().await.remove(&worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lifecycle_of_entry() {
        let registry = WorkerRegistry::new();
        let id = registry.allocate_id();
        let cancel = CancellationToken::new();
        registry.register(id, cancel.clone()).await;

        // 未 attach 时视为启动中
        assert!(registry.is_alive(id).await);

        let token = cancel.clone();
        let join = tokio::spawn(async move {
            token.cancelled().await;
        });
        registry.attach(id, join).await;
        assert!(registry.is_alive(id).await);

        assert!(registry.cancel(id).await);
        // 等 worker 响应取消退出
        for _ in 0..100 {
            if !registry.is_alive(id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!registry.is_alive(id).await);

        registry.remove(id).await;
        assert!(!registry.cancel(id).await);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = WorkerRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }
}
