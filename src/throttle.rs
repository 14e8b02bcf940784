//! 节流协调
//!
//! 同一模型的所有任务共享乘性退避：成功 ×0.9（下限 1.0），被限流 ×1.5（上限 3.0）。
//! 每次调用前按上次用量主动延时；订阅同模型的节流通道，乘数按 max(本地, 收到) 合并，
//! 互不相识的任务无需中心锁即可收敛到同一保守速率。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ThrottleSection;
use crate::error::HiveError;
use crate::model::TokenUsage;
use crate::store::{throttle_channel, TaskStore};

/// 乘数边界（协议约束，不可配置）
pub const MIN_MULTIPLIER: f64 = 1.0;
pub const MAX_MULTIPLIER: f64 = 3.0;
const SUCCESS_DECAY: f64 = 0.9;
const THROTTLE_GROWTH: f64 = 1.5;
/// 估算下一次请求用量时在上次用量上加的余量
const NEXT_CALL_TOKEN_PAD: u64 = 500;

struct GateState {
    multiplier: f64,
    last_request: Option<Instant>,
}

/// 单个模型的节流闸门
pub struct ThrottleGate {
    model_id: String,
    store: TaskStore,
    config: ThrottleSection,
    state: Mutex<GateState>,
}

impl ThrottleGate {
    pub fn new(model_id: impl Into<String>, store: TaskStore, config: ThrottleSection) -> Self {
        Self {
            model_id: model_id.into(),
            store,
            config,
            state: Mutex::new(GateState {
                multiplier: MIN_MULTIPLIER,
                last_request: None,
            }),
        }
    }

    pub async fn multiplier(&self) -> f64 {
        self.state.lock().await.multiplier
    }

    /// 根据上次用量计算本次请求前的最小间隔（线性于输出规模，带下限，乘以当前乘数）
    pub async fn required_delay(&self, last_usage: TokenUsage) -> Duration {
        let tokens = last_usage.input_tokens + last_usage.output_tokens + NEXT_CALL_TOKEN_PAD;
        let base = (tokens as f64 * 60.0 / self.config.tokens_per_minute as f64)
            .max(self.config.min_delay_secs);
        Duration::from_secs_f64(base * self.state.lock().await.multiplier)
    }

    /// 调用前等待：补足距上次请求的剩余间隔；等待期间任务被停止则立即返回 Cancelled
    pub async fn pause_before_call(
        &self,
        last_usage: TokenUsage,
        cancel: &CancellationToken,
    ) -> Result<(), HiveError> {
        let required = self.required_delay(last_usage).await;
        let elapsed = self.state.lock().await.last_request.map(|t| t.elapsed());
        let remaining = match elapsed {
            None => return Ok(()),
            Some(e) => required.saturating_sub(e),
        };
        if remaining.is_zero() {
            return Ok(());
        }
        debug!(model = %self.model_id, wait_ms = remaining.as_millis() as u64, "throttle pause");
        sleep_or_cancel(remaining, cancel).await
    }

    /// 成功调用后：衰减乘数、记录时刻、广播给同模型的其他任务
    pub async fn on_success(&self, task_id: &str) -> Result<(), HiveError> {
        let multiplier = {
            let mut state = self.state.lock().await;
            state.multiplier = (state.multiplier * SUCCESS_DECAY).max(MIN_MULTIPLIER);
            state.last_request = Some(Instant::now());
            state.multiplier
        };
        self.publish("throttle_success", task_id, multiplier).await
    }

    /// 被限流后：抬升乘数、广播、退避一个窗口（含抖动）；返回后由迭代引擎决定是否重入
    pub async fn on_throttled(
        &self,
        task_id: &str,
        last_usage: TokenUsage,
        cancel: &CancellationToken,
    ) -> Result<(), HiveError> {
        let multiplier = {
            let mut state = self.state.lock().await;
            state.multiplier = (state.multiplier * THROTTLE_GROWTH).min(MAX_MULTIPLIER);
            state.multiplier
        };
        self.publish("throttle_exception", task_id, multiplier).await?;

        let backoff = self.required_delay(last_usage).await + self.jitter();
        warn!(
            model = %self.model_id,
            task_id,
            multiplier,
            backoff_secs = backoff.as_secs_f64(),
            "throttled, backing off"
        );
        sleep_or_cancel(backoff, cancel).await
    }

    /// 收到同模型其他任务的乘数：取保守值
    pub async fn observe_peer(&self, peer_multiplier: f64) {
        let mut state = self.state.lock().await;
        if peer_multiplier > state.multiplier {
            state.multiplier = peer_multiplier.min(MAX_MULTIPLIER);
        }
    }

    fn jitter(&self) -> Duration {
        let secs = rand::thread_rng()
            .gen_range(self.config.backoff_jitter_min_secs..=self.config.backoff_jitter_max_secs);
        Duration::from_secs_f64(secs)
    }

    async fn publish(
        &self,
        event_type: &str,
        task_id: &str,
        multiplier: f64,
    ) -> Result<(), HiveError> {
        self.store
            .raw()
            .publish(
                &throttle_channel(&self.model_id),
                json!({
                    "type": event_type,
                    "task_id": task_id,
                    "multiplier": multiplier,
                    "timestamp": chrono::Utc::now(),
                }),
            )
            .await
    }

    /// 后台订阅任务：持续合并同模型节流事件，直到取消
    pub fn spawn_subscriber(self: &Arc<Self>, cancel: CancellationToken) {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = gate
                .store
                .raw()
                .subscribe(&throttle_channel(&gate.model_id))
                .await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if let Some(m) = event.get("multiplier").and_then(|v| v.as_f64()) {
                                gate.observe_peer(m).await;
                            }
                        }
                        // 落后太多被挤掉缓冲，继续收即可；事件只作提示
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), HiveError> {
    if cancel.is_cancelled() {
        return Err(HiveError::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(HiveError::Cancelled),
    }
}

/// 按模型缓存闸门；同进程内同模型的所有任务复用同一个闸门
pub struct ThrottleRegistry {
    store: TaskStore,
    config: ThrottleSection,
    gates: Mutex<HashMap<String, Arc<ThrottleGate>>>,
}

impl ThrottleRegistry {
    pub fn new(store: TaskStore, config: ThrottleSection) -> Self {
        Self {
            store,
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub async fn gate(&self, model_id: &str) -> Arc<ThrottleGate> {
        let mut gates = self.gates.lock().await;
        if let Some(gate) = gates.get(model_id) {
            return Arc::clone(gate);
        }
        info!(model = model_id, "creating throttle gate");
        let gate = Arc::new(ThrottleGate::new(
            model_id,
            self.store.clone(),
            self.config.clone(),
        ));
        gates.insert(model_id.to_string(), Arc::clone(&gate));
        gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_gate() -> ThrottleGate {
        let store = TaskStore::new(Arc::new(MemoryStore::new()));
        ThrottleGate::new("standard", store, ThrottleSection::default())
    }

    #[tokio::test]
    async fn test_success_decays_towards_floor() {
        let gate = test_gate();
        gate.observe_peer(2.0).await;
        for _ in 0..20 {
            gate.on_success("t1").await.unwrap();
        }
        assert_eq!(gate.multiplier().await, MIN_MULTIPLIER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_grows_to_ceiling() {
        let gate = test_gate();
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            gate.on_throttled("t1", TokenUsage::default(), &cancel)
                .await
                .unwrap();
        }
        assert_eq!(gate.multiplier().await, MAX_MULTIPLIER);
    }

    #[tokio::test]
    async fn test_peer_merge_keeps_conservative_value() {
        let gate = test_gate();
        gate.observe_peer(2.5).await;
        assert_eq!(gate.multiplier().await, 2.5);
        // 更低的对端值不回调本地
        gate.observe_peer(1.2).await;
        assert_eq!(gate.multiplier().await, 2.5);
        // 超界值被钳制
        gate.observe_peer(9.0).await;
        assert_eq!(gate.multiplier().await, MAX_MULTIPLIER);
    }

    #[tokio::test]
    async fn test_required_delay_has_floor() {
        let gate = test_gate();
        let delay = gate.required_delay(TokenUsage::default()).await;
        assert!(delay >= Duration::from_secs_f64(0.3));

        let heavy = TokenUsage {
            input_tokens: 100_000,
            output_tokens: 50_000,
            total_tokens: 150_000,
        };
        let heavy_delay = gate.required_delay(heavy).await;
        assert!(heavy_delay > delay);
    }

    #[tokio::test]
    async fn test_first_call_does_not_wait() {
        let gate = test_gate();
        let cancel = CancellationToken::new();
        // last_request 为空时不等待，立即返回
        gate.pause_before_call(TokenUsage::default(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_aborts_on_cancel() {
        let gate = test_gate();
        gate.on_success("t1").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            total_tokens: 1_000_000,
        };
        let err = gate.pause_before_call(usage, &cancel).await.unwrap_err();
        assert!(matches!(err, HiveError::Cancelled));
    }

    #[tokio::test]
    async fn test_subscriber_merges_published_events() {
        let store = TaskStore::new(Arc::new(MemoryStore::new()));
        let registry = ThrottleRegistry::new(store.clone(), ThrottleSection::default());
        let gate = registry.gate("standard").await;
        let cancel = CancellationToken::new();
        gate.spawn_subscriber(cancel.clone());
        // 等订阅任务挂上通道
        tokio::task::yield_now().await;

        store
            .raw()
            .publish(
                &throttle_channel("standard"),
                json!({ "type": "throttle_exception", "task_id": "other", "multiplier": 1.5 }),
            )
            .await
            .unwrap();

        // 订阅在后台任务中消费，轮询等待合并生效
        for _ in 0..50 {
            if gate.multiplier().await >= 1.5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gate.multiplier().await, 1.5);
        cancel.cancel();
    }
}
