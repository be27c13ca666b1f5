//! 同步调度器 - 按入队顺序回放待同步操作
//!
//! 状态流转：
//! ```text
//! Pending -> Attempting -> Confirmed | RetryScheduled | PermanentlyFailed
//! RetryScheduled -> Pending（退避结束）
//! ```
//!
//! - 同一时刻只有一次 drain
//! - 同一 ordering key 的操作严格按序；某个 key 退避时，本次 drain 跳过该 key 的后续操作，
//!   其他 key 继续
//! - 2xx 确认；4xx、序列化失败、重试耗尽为永久失败；其余为瞬时失败

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{HooksDreamSDKError, Result};
use crate::events::{ActionOutcome, EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::optimistic::InFlightRegistry;
use crate::storage::queue::{
    ActionId, ActionPayload, EndpointDescriptor, FailureReason, PendingAction, PendingActionLedger, RetryPolicy,
};
use crate::storage::LocalEntityStore;
use crate::sync::applier::ServerResponseApplier;
use crate::sync::transport::ActionTransport;
use crate::utils::now_millis;

/// 过期重试定时器的检查间隔
const TIMER_TICK: Duration = Duration::from_millis(100);

/// 入队结果
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    /// 已写入待同步队列
    Queued { action_id: ActionId },
    /// 已直接完成（未启用后台同步时）
    Completed { response: Option<Value> },
}

/// 一次 drain 的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub confirmed: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 未到重试时间或被同 key 的失败阻塞
    pub skipped: usize,
    /// 离线，未执行
    pub offline: bool,
}

/// 调度统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub attempts: u64,
    pub confirmed: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct DispatcherMetrics {
    attempts: AtomicU64,
    confirmed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl DispatcherMetrics {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// 单次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptResult {
    Confirmed,
    RetryScheduled,
    Failed,
    Cancelled,
}

/// 同步调度器
pub struct SyncDispatcher {
    ledger: Arc<PendingActionLedger>,
    transport: Arc<dyn ActionTransport>,
    applier: ServerResponseApplier,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    registry: Arc<InFlightRegistry>,
    policy: RetryPolicy,

    drain_lock: tokio::sync::Mutex<()>,
    attempting: Mutex<HashSet<ActionId>>,
    timers: tokio::sync::Mutex<DelayQueue<ActionId>>,

    trigger: Notify,
    shutdown_signal: Notify,
    is_running: AtomicBool,
    metrics: DispatcherMetrics,
}

impl SyncDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<PendingActionLedger>,
        store: Arc<LocalEntityStore>,
        transport: Arc<dyn ActionTransport>,
        events: Arc<EventManager>,
        network: Arc<NetworkMonitor>,
        registry: Arc<InFlightRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            transport,
            applier: ServerResponseApplier::new(store),
            events,
            network,
            registry,
            policy,
            drain_lock: tokio::sync::Mutex::new(()),
            attempting: Mutex::new(HashSet::new()),
            timers: tokio::sync::Mutex::new(DelayQueue::new()),
            trigger: Notify::new(),
            shutdown_signal: Notify::new(),
            is_running: AtomicBool::new(false),
            metrics: DispatcherMetrics::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> DispatcherStats {
        self.metrics.snapshot()
    }

    /// 操作是否正在发送
    pub fn is_in_flight(&self, action_id: &str) -> bool {
        self.attempting.lock().contains(action_id)
    }

    /// 通知后台循环执行一次 drain
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// 回放所有到期的操作
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_with(false).await
    }

    /// 忽略退避时间，立即重试所有操作
    #[instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<DrainReport> {
        self.drain_with(true).await
    }

    async fn drain_with(&self, force: bool) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if !self.network.is_online() {
            debug!("离线，跳过 drain");
            report.offline = true;
            return Ok(report);
        }

        let _drain = self.drain_lock.lock().await;
        let actions = self.ledger.list().await?;
        if actions.is_empty() {
            return Ok(report);
        }
        debug!("🔄 开始 drain: {} 个待同步操作", actions.len());

        let now = now_millis();
        let mut blocked: HashSet<String> = HashSet::new();
        for action in actions {
            let ordering_key = action.payload.ordering_key();
            if blocked.contains(&ordering_key) {
                report.skipped += 1;
                continue;
            }
            if !force {
                if let Some(due) = self.policy.next_attempt_at(action.retry_count, action.last_attempt) {
                    if due > now {
                        blocked.insert(ordering_key);
                        report.skipped += 1;
                        continue;
                    }
                }
            }
            if !self.network.is_online() {
                report.offline = true;
                break;
            }

            match self.attempt(&action).await? {
                AttemptResult::Confirmed => report.confirmed += 1,
                AttemptResult::RetryScheduled => {
                    blocked.insert(ordering_key);
                    report.retry_scheduled += 1;
                }
                AttemptResult::Failed => report.failed += 1,
                AttemptResult::Cancelled => report.cancelled += 1,
            }
        }

        info!(
            "✅ drain 完成: 确认 {}, 重试 {}, 失败 {}, 跳过 {}",
            report.confirmed, report.retry_scheduled, report.failed, report.skipped
        );
        Ok(report)
    }

    #[instrument(skip(self, action), fields(action_id = %action.id, kind = %action.kind()))]
    async fn attempt(&self, action: &PendingAction) -> Result<AttemptResult> {
        let body = match action.payload.request_body() {
            Ok(body) => body,
            Err(e) => {
                let reason = FailureReason::from(&e);
                return self.settle_failed(action, &reason, e.to_string()).await;
            }
        };

        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let response = {
            let _in_flight = action.payload.query_key().map(|key| self.registry.enter(key));
            self.attempting.lock().insert(action.id.clone());
            let response = self.transport.send(&action.target, Some(&body)).await;
            self.attempting.lock().remove(&action.id);

            if let Ok(resp) = &response {
                if resp.is_success() {
                    // 在 in-flight 期间写回，实时推送的回声仍会被抑制
                    return self.settle_confirmed(action, resp.body.as_ref()).await;
                }
            }
            response
        };

        let (reason, message) = match response {
            Ok(resp) => match FailureReason::from_status(resp.status) {
                Some(reason) => (reason, resp.error_message()),
                None => (FailureReason::Unexpected(resp.status), resp.error_message()),
            },
            Err(e) => (FailureReason::from(&e), e.to_string()),
        };

        if self.policy.should_retry(action.retry_count, &reason) {
            self.schedule_retry(action, &reason).await
        } else {
            self.settle_failed(action, &reason, message).await
        }
    }

    async fn settle_confirmed(&self, action: &PendingAction, body: Option<&Value>) -> Result<AttemptResult> {
        if !self.ledger.remove(&action.id).await? {
            debug!("操作 {} 已取消，忽略响应", action.id);
            return Ok(AttemptResult::Cancelled);
        }
        if let Err(e) = self.applier.on_confirmed(action, body).await {
            warn!("⚠️ 应用服务端响应失败 {}: {}", action.id, e);
        }
        self.metrics.confirmed.fetch_add(1, Ordering::Relaxed);
        info!("✅ 操作已确认: {}", action.id);
        self.events.emit(SyncEvent::ActionSettled {
            action_id: action.id.clone(),
            kind: action.kind(),
            outcome: ActionOutcome::Confirmed {
                response: body.cloned(),
            },
            timestamp: now_millis(),
        });
        Ok(AttemptResult::Confirmed)
    }

    async fn settle_failed(&self, action: &PendingAction, reason: &FailureReason, message: String) -> Result<AttemptResult> {
        if !self.ledger.remove(&action.id).await? {
            return Ok(AttemptResult::Cancelled);
        }
        if let Err(e) = self.applier.on_failed(action).await {
            warn!("⚠️ 标记占位条目失败 {}: {}", action.id, e);
        }
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        error!("❌ 操作永久失败 {}: {} ({})", action.id, reason.describe(), message);
        self.events.emit(SyncEvent::ActionSettled {
            action_id: action.id.clone(),
            kind: action.kind(),
            outcome: ActionOutcome::Failed {
                reason: message,
                status: reason.status(),
            },
            timestamp: now_millis(),
        });
        Ok(AttemptResult::Failed)
    }

    async fn schedule_retry(&self, action: &PendingAction, reason: &FailureReason) -> Result<AttemptResult> {
        let Some(updated) = self.ledger.mark_failed(&action.id, &reason.describe()).await? else {
            return Ok(AttemptResult::Cancelled);
        };
        let delay = self.policy.backoff_delay(action.retry_count);
        self.timers.lock().await.insert(action.id.clone(), delay);
        self.metrics.retried.fetch_add(1, Ordering::Relaxed);

        warn!(
            "⚠️ 操作 {} 第 {} 次失败 ({}), {}ms 后重试",
            action.id,
            updated.retry_count,
            reason.describe(),
            delay.as_millis()
        );
        self.events.emit(SyncEvent::ActionRetryScheduled {
            action_id: action.id.clone(),
            kind: action.kind(),
            retry_count: updated.retry_count,
            delay_ms: delay.as_millis() as u64,
        });
        Ok(AttemptResult::RetryScheduled)
    }

    /// 立即执行（未启用后台同步时的路径）
    ///
    /// 成功和永久失败都不会进入队列；瞬时失败时写入队列且 retry_count = 1，
    /// 之后按正常退避重试。离线时直接入队。
    #[instrument(skip(self, payload, target))]
    pub async fn execute_immediately(&self, payload: ActionPayload, target: EndpointDescriptor) -> Result<EnqueueResult> {
        if !self.network.is_online() {
            let action = self.ledger.enqueue(payload, target).await?;
            return Ok(EnqueueResult::Queued { action_id: action.id });
        }

        let key = payload.ordering_key();
        if self.ledger.list().await?.iter().any(|a| a.payload.ordering_key() == key) {
            let action = self.ledger.enqueue(payload, target).await?;
            info!("📥 {} 上仍有待同步操作，{} 排在其后", key, action.id);
            self.trigger();
            return Ok(EnqueueResult::Queued { action_id: action.id });
        }

        let mut action = PendingAction::new(payload, target);
        let body = match action.payload.request_body() {
            Ok(body) => body,
            Err(e) => {
                self.settle_immediate_failure(&action, e.to_string(), None).await;
                return Err(e);
            }
        };
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

        let response = {
            let _in_flight = action.payload.query_key().map(|key| self.registry.enter(key));
            let response = self.transport.send(&action.target, Some(&body)).await;
            if let Ok(resp) = &response {
                if resp.is_success() {
                    if let Err(e) = self.applier.on_confirmed(&action, resp.body.as_ref()).await {
                        warn!("⚠️ 应用服务端响应失败 {}: {}", action.id, e);
                    }
                }
            }
            response
        };

        let reason = match &response {
            Ok(resp) if resp.is_success() => {
                self.metrics.confirmed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(SyncEvent::ActionSettled {
                    action_id: action.id.clone(),
                    kind: action.kind(),
                    outcome: ActionOutcome::Confirmed {
                        response: resp.body.clone(),
                    },
                    timestamp: now_millis(),
                });
                return Ok(EnqueueResult::Completed {
                    response: resp.body.clone(),
                });
            }
            Ok(resp) => FailureReason::from_status(resp.status).unwrap_or(FailureReason::Unexpected(resp.status)),
            Err(e) => FailureReason::from(e),
        };

        if !reason.is_retryable() {
            let message = match &response {
                Ok(resp) => resp.error_message(),
                Err(e) => e.to_string(),
            };
            self.settle_immediate_failure(&action, message.clone(), reason.status()).await;
            return Err(match response {
                Ok(resp) => HooksDreamSDKError::PermanentRequest {
                    status: resp.status,
                    message,
                },
                Err(e) => e,
            });
        }

        action.retry_count = 1;
        action.last_attempt = Some(now_millis());
        action.last_error = Some(reason.describe());
        self.ledger.insert(&action).await?;
        let delay = self.policy.backoff_delay(0);
        self.timers.lock().await.insert(action.id.clone(), delay);
        self.metrics.retried.fetch_add(1, Ordering::Relaxed);

        info!("📥 立即执行失败，已转入队列: {} ({})", action.id, reason.describe());
        self.events.emit(SyncEvent::ActionQueued {
            action_id: action.id.clone(),
            kind: action.kind(),
        });
        self.events.emit(SyncEvent::ActionRetryScheduled {
            action_id: action.id.clone(),
            kind: action.kind(),
            retry_count: 1,
            delay_ms: delay.as_millis() as u64,
        });
        Ok(EnqueueResult::Queued { action_id: action.id })
    }

    /// 立即执行的永久失败：操作从未入队，只回滚占位并广播结果
    async fn settle_immediate_failure(&self, action: &PendingAction, message: String, status: Option<u16>) {
        if let Err(e) = self.applier.on_failed(action).await {
            warn!("⚠️ 标记占位条目失败 {}: {}", action.id, e);
        }
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        error!("❌ 立即执行失败 {}: {}", action.id, message);
        self.events.emit(SyncEvent::ActionSettled {
            action_id: action.id.clone(),
            kind: action.kind(),
            outcome: ActionOutcome::Failed { reason: message, status },
            timestamp: now_millis(),
        });
    }

    /// 取消操作；正在发送的请求会继续，但结果被忽略
    pub async fn cancel(&self, action_id: &str) -> Result<bool> {
        let Some(action) = self.ledger.get(action_id).await? else {
            return Ok(false);
        };
        if !self.ledger.remove(action_id).await? {
            return Ok(false);
        }
        self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
        info!("🚫 操作已取消: {}", action_id);
        self.events.emit(SyncEvent::ActionSettled {
            action_id: action.id,
            kind: action.payload.kind(),
            outcome: ActionOutcome::Cancelled,
            timestamp: now_millis(),
        });
        Ok(true)
    }

    /// 取出到期的重试定时器，返回数量
    async fn harvest_expired(&self) -> usize {
        let mut timers = self.timers.lock().await;
        let mut expired = 0;
        while let Some(Some(item)) = timers.next().now_or_never() {
            debug!("重试时间到: {}", item.get_ref());
            expired += 1;
        }
        expired
    }

    /// 启动后台循环：网络恢复、手动触发、重试定时器到期时 drain
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(HooksDreamSDKError::Other("调度器已在运行".to_string()));
        }
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run_loop().await }))
    }

    async fn run_loop(self: Arc<Self>) {
        info!("🚀 同步调度器已启动");
        let mut network_events = self.network.subscribe();
        let mut tick = tokio::time::interval(TIMER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.is_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown_signal.notified() => break,
                _ = self.trigger.notified() => {}
                event = network_events.recv() => match event {
                    Ok(event) if event.is_reconnect() => info!("🌐 网络恢复，开始同步"),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    if self.harvest_expired().await == 0 {
                        continue;
                    }
                }
            }

            if let Err(e) = self.drain().await {
                error!("❌ drain 失败: {}", e);
            }
        }
        info!("同步调度器已停止");
    }

    /// 停止后台循环
    pub fn shutdown(&self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            self.shutdown_signal.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::network::NetworkStatus;
    use crate::storage::queue::{ActionKind, FollowUserPayload, LikePostPayload};
    use crate::storage::QueryKey;
    use crate::sync::transport::test_helpers::ScriptedTransport;
    use crate::sync::transport::TransportResponse;
    use serde_json::json;

    struct Harness {
        dispatcher: Arc<SyncDispatcher>,
        ledger: Arc<PendingActionLedger>,
        transport: Arc<ScriptedTransport>,
        events: Arc<EventManager>,
        network: Arc<NetworkMonitor>,
        registry: Arc<InFlightRegistry>,
    }

    async fn harness(policy: RetryPolicy) -> Harness {
        let events = Arc::new(EventManager::new(256));
        let store = Arc::new(LocalEntityStore::in_memory(events.clone()).await.unwrap());
        let ledger = Arc::new(PendingActionLedger::new(store.clone()));
        let transport = ScriptedTransport::new();
        let network = Arc::new(NetworkMonitor::new(NetworkStatus::Online));
        let registry = InFlightRegistry::new();
        let dispatcher = Arc::new(SyncDispatcher::new(
            ledger.clone(),
            store,
            transport.clone(),
            events.clone(),
            network.clone(),
            registry.clone(),
            policy,
        ));
        Harness {
            dispatcher,
            ledger,
            transport,
            events,
            network,
            registry,
        }
    }

    fn follow(user_id: &str, follow: bool) -> ActionPayload {
        ActionPayload::FollowUser(FollowUserPayload {
            user_id: user_id.to_string(),
            follow,
        })
    }

    fn like(post_id: &str) -> ActionPayload {
        ActionPayload::LikePost(LikePostPayload {
            post_id: post_id.to_string(),
            like: true,
        })
    }

    fn endpoint(path: &str) -> EndpointDescriptor {
        EndpointDescriptor::post(format!("https://api.test{}", path))
    }

    #[tokio::test]
    async fn test_rejected_action_is_attempted_exactly_once() {
        let h = harness(RetryPolicy::default()).await;
        let mut settled = h
            .events
            .subscribe_filtered(EventFilter::new().with_event_types(vec!["action_settled".to_string()]));
        h.ledger.enqueue(like("p1"), endpoint("/api/posts/p1/like")).await.unwrap();
        h.transport.push(TransportResponse::new(400, Some(json!({ "message": "bad post" }))));

        let report = h.dispatcher.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.ledger.count().await.unwrap(), 0);

        h.dispatcher.drain().await.unwrap();
        assert_eq!(h.transport.request_count(), 1);

        match settled.try_recv().unwrap() {
            SyncEvent::ActionSettled { outcome, .. } => assert_eq!(
                outcome,
                ActionOutcome::Failed {
                    reason: "bad post".to_string(),
                    status: Some(400)
                }
            ),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let h = harness(RetryPolicy {
            base_delay_ms: 60_000,
            ..RetryPolicy::default()
        })
        .await;
        let action = h.ledger.enqueue(like("p1"), endpoint("/api/posts/p1/like")).await.unwrap();
        h.transport.push_status(503);

        let report = h.dispatcher.drain().await.unwrap();
        assert_eq!(report.retry_scheduled, 1);
        let stored = h.ledger.get(&action.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);

        // 未到重试时间
        let report = h.dispatcher.drain().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.transport.request_count(), 1);

        // 手动重试忽略退避
        let report = h.dispatcher.retry_failed().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(h.ledger.count().await.unwrap(), 0);
        assert_eq!(h.dispatcher.stats().retried, 1);
    }

    #[tokio::test]
    async fn test_backoff_blocks_only_its_own_key() {
        let h = harness(RetryPolicy::default()).await;
        let a = h.ledger.enqueue(follow("42", true), endpoint("/api/users/42/follow")).await.unwrap();
        let b = h.ledger.enqueue(follow("42", false), endpoint("/api/users/42/follow")).await.unwrap();
        let c = h.ledger.enqueue(like("p1"), endpoint("/api/posts/p1/like")).await.unwrap();
        h.transport.push_network_error();
        h.transport.push_status(200);

        let report = h.dispatcher.drain().await.unwrap();
        assert_eq!(report.retry_scheduled, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.skipped, 1);

        let urls: Vec<String> = h.transport.requests().into_iter().map(|r| r.endpoint.url).collect();
        assert_eq!(urls, vec!["https://api.test/api/users/42/follow", "https://api.test/api/posts/p1/like"]);

        let remaining: Vec<ActionId> = h.ledger.list().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(remaining, vec![a.id, b.id]);
        assert!(!h.ledger.contains(&c.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_permanent() {
        let h = harness(RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        })
        .await;
        h.ledger.enqueue(like("p1"), endpoint("/x")).await.unwrap();
        h.transport.push_status(500);
        h.transport.push_status(500);

        assert_eq!(h.dispatcher.retry_failed().await.unwrap().retry_scheduled, 1);
        assert_eq!(h.dispatcher.retry_failed().await.unwrap().failed, 1);
        assert_eq!(h.ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_drain_is_skipped() {
        let h = harness(RetryPolicy::default()).await;
        h.network.set_status(NetworkStatus::Offline);
        h.ledger.enqueue(like("p1"), endpoint("/x")).await.unwrap();

        let report = h.dispatcher.drain().await.unwrap();
        assert!(report.offline);
        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(h.ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_attempt_ignores_result() {
        let h = harness(RetryPolicy::default()).await;
        let action = h.ledger.enqueue(follow("42", true), endpoint("/api/users/42/follow")).await.unwrap();
        let gate = h.transport.gate();

        let drain = {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move { dispatcher.drain().await })
        };
        for _ in 0..50 {
            if h.dispatcher.is_in_flight(&action.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.dispatcher.is_in_flight(&action.id));
        assert!(h.registry.is_in_flight(&QueryKey::user("42")));

        assert!(h.dispatcher.cancel(&action.id).await.unwrap());
        gate.notify_one();

        let report = drain.await.unwrap().unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.confirmed, 0);
        assert_eq!(h.dispatcher.stats().cancelled, 1);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_immediately_paths() {
        let h = harness(RetryPolicy::default()).await;

        h.transport.push(TransportResponse::ok(json!({ "success": true, "data": { "_id": "p9" } })));
        let result = h.dispatcher.execute_immediately(like("p1"), endpoint("/x")).await.unwrap();
        assert!(matches!(result, EnqueueResult::Completed { .. }));

        h.transport.push_status(422);
        let err = h.dispatcher.execute_immediately(like("p1"), endpoint("/x")).await.unwrap_err();
        assert_eq!(err.kind(), "permanent_request");
        assert_eq!(h.ledger.count().await.unwrap(), 0);

        h.transport.push_status(502);
        let EnqueueResult::Queued { action_id } = h.dispatcher.execute_immediately(like("p1"), endpoint("/x")).await.unwrap() else {
            panic!("expected queued");
        };
        let queued = h.ledger.get(&action_id).await.unwrap().unwrap();
        assert_eq!(queued.retry_count, 1);
        assert_eq!(queued.kind(), ActionKind::LikePost);
    }

    #[tokio::test]
    async fn test_execute_immediately_waits_behind_pending_key() {
        let h = harness(RetryPolicy::default()).await;
        let earlier = h.ledger.enqueue(follow("42", true), endpoint("/api/users/42/follow")).await.unwrap();

        let EnqueueResult::Queued { action_id } = h
            .dispatcher
            .execute_immediately(follow("42", false), endpoint("/api/users/42/follow"))
            .await
            .unwrap()
        else {
            panic!("expected queued");
        };
        assert_eq!(h.transport.request_count(), 0);
        let order: Vec<ActionId> = h.ledger.list().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(order, vec![earlier.id.clone(), action_id]);

        // 其它键不受影响
        let result = h.dispatcher.execute_immediately(like("p1"), endpoint("/x")).await.unwrap();
        assert!(matches!(result, EnqueueResult::Completed { .. }));
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_immediately_permanent_failure_is_settled() {
        let h = harness(RetryPolicy::default()).await;
        let mut settled = h
            .events
            .subscribe_filtered(EventFilter::new().with_event_types(vec!["action_settled".to_string()]));
        h.transport.push(TransportResponse::new(404, Some(json!({ "message": "no such post" }))));

        assert!(h.dispatcher.execute_immediately(like("p1"), endpoint("/x")).await.is_err());
        assert_eq!(h.dispatcher.stats().failed, 1);
        match settled.try_recv().unwrap() {
            SyncEvent::ActionSettled { kind, outcome, .. } => {
                assert_eq!(kind, ActionKind::LikePost);
                assert_eq!(
                    outcome,
                    ActionOutcome::Failed {
                        reason: "no such post".to_string(),
                        status: Some(404)
                    }
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_triggers_background_drain() {
        let h = harness(RetryPolicy::default()).await;
        h.network.set_status(NetworkStatus::Offline);
        h.ledger.enqueue(like("p1"), endpoint("/x")).await.unwrap();
        let handle = h.dispatcher.start().unwrap();
        assert!(h.dispatcher.start().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.network.set_status(NetworkStatus::Online);

        for _ in 0..100 {
            if h.ledger.count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.ledger.count().await.unwrap(), 0);

        h.dispatcher.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
