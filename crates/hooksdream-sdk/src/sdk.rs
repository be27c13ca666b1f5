//! 统一 SDK 接口 - HooksDreamSDK 主入口
//!
//! 分层架构：
//! ```text
//! HooksDreamSDK (业务逻辑层)
//!   ├── CapabilityBroker (平台能力)
//!   ├── LocalEntityStore + PendingActionLedger (存储层)
//!   ├── OptimisticCoordinator (乐观更新)
//!   ├── SyncDispatcher (同步回放)
//!   ├── RealtimeReconciler (实时推送)
//!   ├── EventManager (事件系统)
//!   └── NetworkMonitor (网络监控)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{
    BadgeUpdate, Capability, CapabilityBroker, CapabilitySet, PermissionState, PlatformProviders, StorageUsage,
};
use crate::error::{HooksDreamSDKError, Result};
use crate::events::{Disposer, EventFilter, EventManager, SyncEvent};
use crate::http_client::HttpTransport;
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::optimistic::{InFlightRegistry, NetworkOutcome, OptimisticCoordinator};
use crate::realtime::RealtimeReconciler;
use crate::storage::queue::{
    ActionKind, ActionPayload, CreatePostPayload, EndpointDescriptor, FollowUserPayload, HttpMethod, LikePostPayload,
    PendingAction, PendingActionLedger, RetryPolicy, SendMessagePayload, UploadImagePayload,
};
use crate::storage::{
    CachedEntity, CachedMessage, CachedPost, CachedUser, CleanupPolicy, CleanupReport, Entity, LocalEntityStore,
    QueryKey, SettingsStore,
};
use crate::sync::{ActionTransport, DispatcherStats, DrainReport, SyncDispatcher};
use crate::utils::now_millis;

pub use crate::sync::EnqueueResult;

/// 存储占用超过该百分比时建议清理缓存
const STORAGE_WARNING_PERCENT: f64 = 80.0;
/// 待同步操作超过该数量时建议检查网络
const PENDING_WARNING_COUNT: usize = 10;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(60),
        }
    }
}

/// HooksDream SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// API 基础 URL，例如 https://api.example.com
    pub api_base_url: String,
    /// 当前登录用户
    pub local_user_id: Option<String>,
    /// Bearer token，入队时写入请求头
    pub auth_token: Option<String>,
    /// 重试策略
    pub retry: RetryPolicy,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 事件缓冲区大小
    pub event_channel_capacity: usize,
    /// 存储配额（字节）
    pub storage_quota_bytes: u64,
    /// 缓存清理策略
    pub cleanup: CleanupPolicy,
    /// 只使用内存存储
    pub memory_only: bool,
    /// 启动时假定网络在线
    pub assume_online: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "http://localhost:5000".to_string(),
            local_user_id: None,
            auth_token: None,
            retry: RetryPolicy::default(),
            http: HttpClientConfig::default(),
            event_channel_capacity: 256,
            storage_quota_bytes: 50 * 1024 * 1024,
            cleanup: CleanupPolicy::default(),
            memory_only: false,
            assume_online: true,
        }
    }
}

/// 获取默认数据目录 ~/.hooksdream/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".hooksdream")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".hooksdream")
    } else {
        PathBuf::from("./hooksdream_data")
    }
}

/// SDK 配置构建器
pub struct SdkConfigBuilder {
    config: SdkConfig,
}

impl SdkConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SdkConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn local_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.local_user_id = Some(user_id.into());
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http = config;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    pub fn storage_quota_bytes(mut self, quota: u64) -> Self {
        self.config.storage_quota_bytes = quota;
        self
    }

    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.config.cleanup = policy;
        self
    }

    pub fn memory_only(mut self, enabled: bool) -> Self {
        self.config.memory_only = enabled;
        self
    }

    pub fn assume_online(mut self, online: bool) -> Self {
        self.config.assume_online = online;
        self
    }

    pub fn build(self) -> SdkConfig {
        self.config
    }
}

impl Default for SdkConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SdkConfig {
    pub fn builder() -> SdkConfigBuilder {
        SdkConfigBuilder::new()
    }
}

/// 同步状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_installed: bool,
    pub has_notification_permission: bool,
    pub pending_actions_count: usize,
    pub storage_usage: StorageUsage,
}

/// 健康报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: SyncStatus,
    pub capabilities: CapabilitySet,
    pub is_installable: bool,
    pub dispatcher: DispatcherStats,
    pub recommendations: Vec<String>,
}

/// 当前会话
#[derive(Debug, Clone, Default)]
struct Session {
    user_id: Option<String>,
    token: Option<String>,
}

/// 入队路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryMode {
    /// 写入队列，由后台 drain
    Queued,
    /// 立即执行，只有瞬时失败才入队
    Immediate,
}

/// 统一 SDK 主接口
pub struct HooksDreamSDK {
    config: SdkConfig,
    events: Arc<EventManager>,
    broker: Arc<CapabilityBroker>,
    store: Arc<LocalEntityStore>,
    ledger: Arc<PendingActionLedger>,
    network: Arc<NetworkMonitor>,
    coordinator: OptimisticCoordinator,
    dispatcher: Arc<SyncDispatcher>,
    reconciler: Arc<RealtimeReconciler>,
    lifecycle: LifecycleManager,
    session: RwLock<Session>,

    last_status: Mutex<Option<SyncStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    status_shutdown: Arc<Notify>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl HooksDreamSDK {
    /// 初始化 SDK
    ///
    /// 分层初始化顺序：
    /// 1. 事件层 → 2. 能力层 → 3. 存储层 → 4. 同步层 → 5. 生命周期
    pub async fn initialize(
        config: SdkConfig,
        providers: PlatformProviders,
        transport: Arc<dyn ActionTransport>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 HooksDreamSDK v{}...", crate::version::SDK_VERSION);
        Self::validate_config(&config)?;

        // === 第1层：事件管理器 ===
        let events = Arc::new(EventManager::new(config.event_channel_capacity));

        // === 第2层：平台能力 ===
        let broker = Arc::new(CapabilityBroker::new(providers, events.clone()));
        let capabilities = broker.detect();

        // === 第3层：存储 ===
        let data_dir = if config.memory_only || !capabilities.durable_storage {
            info!("ℹ️ 使用内存存储 (memory_only={})", config.memory_only);
            None
        } else {
            Some(config.data_dir.as_path())
        };
        let store = Arc::new(LocalEntityStore::open(data_dir, events.clone(), Some(broker.clone())).await?);
        let ledger = Arc::new(PendingActionLedger::new(store.clone()));

        // === 第4层：网络与同步 ===
        let initial = if config.assume_online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        let network = Arc::new(NetworkMonitor::new(initial));
        let registry = InFlightRegistry::new();
        let coordinator = OptimisticCoordinator::new(store.clone(), events.clone(), registry.clone());
        let dispatcher = Arc::new(SyncDispatcher::new(
            ledger.clone(),
            store.clone(),
            transport,
            events.clone(),
            network.clone(),
            registry.clone(),
            config.retry.clone(),
        ));
        let reconciler = Arc::new(RealtimeReconciler::new(
            store.clone(),
            events.clone(),
            registry,
            config.local_user_id.clone(),
        ));

        // === 第5层：生命周期 ===
        let lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(
            dispatcher.clone(),
            ledger.clone(),
            broker.clone(),
        )));

        let session = Session {
            user_id: config.local_user_id.clone(),
            token: config.auth_token.clone(),
        };
        let sdk = Arc::new(Self {
            config,
            events,
            broker,
            store,
            ledger,
            network,
            coordinator,
            dispatcher,
            reconciler,
            lifecycle,
            session: RwLock::new(session),
            last_status: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            status_shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });

        info!("✅ HooksDreamSDK 初始化完成: {:?}", capabilities);
        Ok(sdk)
    }

    /// 使用 reqwest 传输初始化
    pub async fn initialize_with_http(config: SdkConfig, providers: PlatformProviders) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpTransport::new(&config.http)?);
        Self::initialize(config, providers, transport).await
    }

    fn validate_config(config: &SdkConfig) -> Result<()> {
        if !(config.api_base_url.starts_with("http://") || config.api_base_url.starts_with("https://")) {
            return Err(HooksDreamSDKError::Config(format!(
                "api_base_url 必须是 http(s) 地址: {}",
                config.api_base_url
            )));
        }
        if config.event_channel_capacity == 0 {
            return Err(HooksDreamSDKError::Config("event_channel_capacity 不能为 0".to_string()));
        }
        if config.retry.base_delay_ms == 0 || config.retry.max_delay_ms < config.retry.base_delay_ms {
            return Err(HooksDreamSDKError::Config("重试延迟配置无效".to_string()));
        }
        Ok(())
    }

    /// 启动后台任务：同步调度、实时推送、状态广播
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HooksDreamSDKError::Other("SDK 已启动".to_string()));
        }
        let mut tasks = self.tasks.lock();
        tasks.push(self.dispatcher.start()?);
        tasks.push(self.reconciler.start()?);
        tasks.push(self.spawn_status_task());
        self.dispatcher.trigger();
        info!("🚀 HooksDreamSDK 后台任务已启动");
        Ok(())
    }

    /// 停止后台任务并刷新设置
    pub async fn shutdown(&self) -> Result<()> {
        info!("🔄 正在关闭 HooksDreamSDK...");
        self.shut_down.store(true, Ordering::SeqCst);
        self.dispatcher.shutdown();
        self.reconciler.shutdown();
        self.status_shutdown.notify_one();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("⚠️ 后台任务退出异常: {}", e);
            }
        }
        self.broker.release_wake_lock().await;
        self.store.settings().flush().await?;
        self.started.store(false, Ordering::SeqCst);
        info!("✅ HooksDreamSDK 已关闭");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(HooksDreamSDKError::ShuttingDown("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    /// 网络、队列、能力变化时重新计算状态，变化时广播 `StatusChanged`
    fn spawn_status_task(self: &Arc<Self>) -> JoinHandle<()> {
        let sdk: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.status_shutdown.clone();
        let mut network_events = self.network.subscribe();
        let mut bus = self.events.subscribe_filtered(EventFilter::new().with_event_types(vec![
            "action_queued".to_string(),
            "action_settled".to_string(),
            "action_discarded".to_string(),
            "capability_downgraded".to_string(),
        ]));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    event = network_events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                    event = bus.recv() => {
                        if event.is_none() {
                            break;
                        }
                    }
                }
                let Some(sdk) = sdk.upgrade() else {
                    break;
                };
                if let Err(e) = sdk.publish_status().await {
                    warn!("⚠️ 计算同步状态失败: {}", e);
                }
            }
            debug!("状态广播任务已停止");
        })
    }

    async fn publish_status(&self) -> Result<()> {
        let status = self.get_status().await?;
        let changed = {
            let mut last = self.last_status.lock();
            if last.as_ref() == Some(&status) {
                false
            } else {
                *last = Some(status.clone());
                true
            }
        };
        if changed {
            self.events.emit(SyncEvent::StatusChanged(status));
        }
        Ok(())
    }

    // ========== 会话 ==========

    /// 设置当前用户和 token；已入队的操作保留入队时的 token
    pub fn set_session(&self, user_id: Option<String>, token: Option<String>) {
        self.reconciler.set_local_user(user_id.clone());
        *self.session.write() = Session { user_id, token };
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.session.read().user_id.clone()
    }

    fn endpoint(&self, method: HttpMethod, path: &str) -> EndpointDescriptor {
        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);
        EndpointDescriptor::new(method, url).with_bearer(self.session.read().token.as_deref())
    }

    // ========== 入队 API ==========

    /// 入队一个操作
    ///
    /// 支持后台同步时写入队列并返回 `Queued`；否则立即执行（页面打开期间尽力而为），
    /// 成功返回 `Completed`，永久失败返回错误，瞬时失败转入队列。
    pub async fn queue_action(&self, payload: ActionPayload, endpoint: EndpointDescriptor) -> Result<EnqueueResult> {
        self.ensure_running()?;
        let mode = self.broker.with_capability(
            Capability::BackgroundExecution,
            || DeliveryMode::Queued,
            || DeliveryMode::Immediate,
        );

        match mode {
            DeliveryMode::Queued => {
                let action = self.ledger.enqueue(payload, endpoint).await?;
                self.broker.register_background_sync(action.kind().sync_tag()).await;
                if self.network.is_online() {
                    self.dispatcher.trigger();
                }
                Ok(EnqueueResult::Queued { action_id: action.id })
            }
            DeliveryMode::Immediate => self.dispatcher.execute_immediately(payload, endpoint).await,
        }
    }

    /// 发布帖子（不做乐观占位，确认后写入服务端返回的帖子）
    pub async fn queue_create_post(&self, content: &str, images: Vec<String>) -> Result<EnqueueResult> {
        let payload = ActionPayload::CreatePost(CreatePostPayload {
            content: content.to_string(),
            images,
            client_id: None,
        });
        self.queue_action(payload, self.endpoint(HttpMethod::Post, "/api/posts"))
            .await
    }

    /// 发送消息，先写入状态为 `sending` 的占位消息
    pub async fn queue_send_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: &str,
    ) -> Result<EnqueueResult> {
        let client_id = format!("tmp-{}", Uuid::new_v4().simple());
        if let Some(sender_id) = self.local_user_id() {
            let created_at = now_millis();
            let placeholder = CachedMessage {
                id: client_id.clone(),
                conversation_id: conversation_id.to_string(),
                sender_id,
                content: content.to_string(),
                message_type: message_type.to_string(),
                status: "sending".to_string(),
                created_at,
            };
            self.store.put(&CachedEntity::new(placeholder, created_at)).await?;
        }

        let payload = ActionPayload::SendMessage(SendMessagePayload {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            message_type: message_type.to_string(),
            client_id: Some(client_id),
        });
        let path = format!("/api/chat/conversations/{}/messages", conversation_id);
        self.queue_action(payload, self.endpoint(HttpMethod::Post, &path)).await
    }

    /// 切换点赞状态（乐观更新）
    pub async fn toggle_like(&self, post_id: &str) -> Result<EnqueueResult> {
        self.mutate_with_action::<CachedPost, _, _>(
            QueryKey::post(post_id),
            |current| {
                current.map(|post| {
                    let mut next = post.clone();
                    next.is_liked = !post.is_liked;
                    next.likes_count = (post.likes_count + if next.is_liked { 1 } else { -1 }).max(0);
                    next
                })
            },
            |optimistic| {
                let like = optimistic.map(|p| p.is_liked).unwrap_or(true);
                let method = if like { HttpMethod::Post } else { HttpMethod::Delete };
                (
                    ActionPayload::LikePost(LikePostPayload {
                        post_id: post_id.to_string(),
                        like,
                    }),
                    self.endpoint(method, &format!("/api/posts/{}/like", post_id)),
                )
            },
        )
        .await
    }

    /// 切换关注状态（乐观更新）
    pub async fn toggle_follow(&self, user_id: &str) -> Result<EnqueueResult> {
        self.mutate_with_action::<CachedUser, _, _>(
            QueryKey::user(user_id),
            |current| current.map(|user| with_following(user, !user.is_following)),
            |optimistic| self.follow_action(user_id, optimistic.map(|u| u.is_following).unwrap_or(true)),
        )
        .await
    }

    /// 设置关注状态（乐观更新）
    pub async fn set_follow(&self, user_id: &str, follow: bool) -> Result<EnqueueResult> {
        self.mutate_with_action::<CachedUser, _, _>(
            QueryKey::user(user_id),
            |current| current.map(|user| with_following(user, follow)),
            |_| self.follow_action(user_id, follow),
        )
        .await
    }

    fn follow_action(&self, user_id: &str, follow: bool) -> (ActionPayload, EndpointDescriptor) {
        let method = if follow { HttpMethod::Post } else { HttpMethod::Delete };
        (
            ActionPayload::FollowUser(FollowUserPayload {
                user_id: user_id.to_string(),
                follow,
            }),
            self.endpoint(method, &format!("/api/users/{}/follow", user_id)),
        )
    }

    /// 上传图片（multipart，文件字段 `image`）
    pub async fn upload_image(
        &self,
        local_path: &str,
        file_name: &str,
        content_type: &str,
        post_id: Option<String>,
    ) -> Result<EnqueueResult> {
        let payload = ActionPayload::UploadImage(UploadImagePayload {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            local_path: local_path.to_string(),
            post_id,
        });
        let endpoint = self.endpoint(HttpMethod::Post, "/api/upload/image").with_multipart("image");
        self.queue_action(payload, endpoint).await
    }

    /// 乐观更新 + 入队
    ///
    /// `build` 根据乐观值决定要入队的操作，在条目锁内执行，连续切换不会交错。
    async fn mutate_with_action<T, U, B>(&self, key: QueryKey, updater: U, build: B) -> Result<EnqueueResult>
    where
        T: Entity,
        U: FnOnce(Option<&T>) -> Option<T>,
        B: FnOnce(Option<&T>) -> (ActionPayload, EndpointDescriptor),
    {
        let mut result = None;
        let slot = &mut result;
        self.coordinator
            .mutate::<T, _, _, _>(key.clone(), updater, |optimistic| async move {
                let (payload, endpoint) = build(optimistic.as_ref());
                let enqueued = self.queue_action(payload, endpoint).await?;
                let outcome = match &enqueued {
                    EnqueueResult::Queued { action_id } => NetworkOutcome::Deferred(action_id.clone()),
                    EnqueueResult::Completed { .. } => NetworkOutcome::Applied,
                };
                *slot = Some(enqueued);
                Ok(outcome)
            })
            .await?;
        result.ok_or_else(|| HooksDreamSDKError::Other(format!("{} 未产生操作", key)))
    }

    // ========== 队列管理 ==========

    /// 立即回放到期的操作
    pub async fn drain(&self) -> Result<DrainReport> {
        self.dispatcher.drain().await
    }

    /// 忽略退避时间，重试所有失败过的操作
    pub async fn retry_failed_actions(&self) -> Result<DrainReport> {
        self.dispatcher.retry_failed().await
    }

    pub async fn cancel_action(&self, action_id: &str) -> Result<bool> {
        self.dispatcher.cancel(action_id).await
    }

    pub async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
        self.ledger.list().await
    }

    pub async fn pending_actions_by_kind(&self, kind: ActionKind) -> Result<Vec<PendingAction>> {
        self.ledger.list_by_kind(kind).await
    }

    pub async fn clear_pending_actions(&self) -> Result<usize> {
        let removed = self.ledger.clear().await?;
        info!("🗑️ 已清空待同步队列: {} 条", removed);
        Ok(removed)
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    // ========== 网络与实时推送 ==========

    /// 宿主上报网络状态；恢复在线时后台循环会自动 drain
    pub fn set_network_status(&self, status: NetworkStatus) -> bool {
        let changed = self.network.set_status(status);
        if changed && status.is_reachable() {
            self.dispatcher.trigger();
        }
        changed
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.status()
    }

    /// 双工通道收到的推送，交给实时推送协调器处理
    pub fn push_realtime(&self, event_type: &str, payload: Value) {
        self.events.emit(SyncEvent::RealtimeReceived {
            event_type: event_type.to_string(),
            payload,
        });
    }

    pub fn realtime(&self) -> &Arc<RealtimeReconciler> {
        &self.reconciler
    }

    // ========== 生命周期 ==========

    pub async fn notify_foreground(&self) -> Result<()> {
        self.lifecycle.notify_foreground().await
    }

    pub async fn notify_background(&self) -> Result<()> {
        self.lifecycle.notify_background().await
    }

    /// 宿主分配的后台同步时段
    pub async fn notify_sync_slot(&self, tag: &str) -> Result<()> {
        self.lifecycle.notify_sync_slot(tag).await
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    // ========== 能力与状态 ==========

    pub fn get_capabilities(&self) -> CapabilitySet {
        self.broker.effective()
    }

    pub fn capabilities(&self) -> &Arc<CapabilityBroker> {
        &self.broker
    }

    pub async fn request_notification_permission(&self) -> PermissionState {
        self.broker.request_notification_permission().await
    }

    pub async fn update_badge(&self, update: BadgeUpdate) {
        self.broker.update_badge(update).await
    }

    pub async fn get_status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            is_online: self.network.is_online(),
            is_installed: self.broker.is_installed(),
            has_notification_permission: self.broker.has_notification_permission(),
            pending_actions_count: self.ledger.count().await?,
            storage_usage: self.broker.storage_usage().await,
        })
    }

    /// 状态变化回调，返回取消订阅的闭包
    pub fn on_status_change<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.events.on("status_changed", move |event| {
            if let SyncEvent::StatusChanged(status) = event {
                callback(status);
            }
        })
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        let capabilities = self.broker.effective();
        let status = self.get_status().await?;
        let is_installable = self.broker.is_installable();

        let mut recommendations = Vec::new();
        if !capabilities.push_delivery {
            recommendations.push("Enable push notifications for better engagement".to_string());
        }
        if !status.has_notification_permission {
            recommendations.push("Grant notification permission to receive updates".to_string());
        }
        if !status.is_installed && is_installable {
            recommendations.push("Install app to home screen for better experience".to_string());
        }
        if status.storage_usage.percentage > STORAGE_WARNING_PERCENT {
            recommendations.push("Clear cache to free up storage space".to_string());
        }
        if status.pending_actions_count > PENDING_WARNING_COUNT {
            recommendations.push("Check internet connection - many actions are pending".to_string());
        }

        Ok(HealthReport {
            status,
            capabilities,
            is_installable,
            dispatcher: self.dispatcher.stats(),
            recommendations,
        })
    }

    // ========== 存储 ==========

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn store(&self) -> &Arc<LocalEntityStore> {
        &self.store
    }

    pub fn settings(&self) -> &SettingsStore {
        self.store.settings()
    }

    /// 按配置的策略清理缓存
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.store.cleanup(&self.config.cleanup).await
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }
}

fn with_following(user: &CachedUser, follow: bool) -> CachedUser {
    let mut next = user.clone();
    if user.is_following != follow {
        next.is_following = follow;
        next.follower_count = (user.follower_count + if follow { 1 } else { -1 }).max(0);
    }
    next
}
