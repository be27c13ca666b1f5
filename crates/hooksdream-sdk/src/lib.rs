//! HooksDream SDK - 离线优先的社交客户端同步 SDK
//!
//! 本 SDK 提供：
//! - 💾 本地实体缓存：用户、帖子、消息、会话，时间戳单调写入
//! - 📤 待同步队列：离线操作持久化，按指数退避重试
//! - ⚡ 乐观更新：先改本地缓存，失败时回滚
//! - 📡 实时推送协调：服务端推送与本地缓存合并，抑制自身回声
//! - 🧩 平台能力探测：后台同步、推送、角标、屏幕常亮，缺失时降级
//! - ⚙️ 事件系统：统一的事件管理和回调机制
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use hooksdream_sdk::{HooksDreamSDK, PlatformProviders, SdkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SdkConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.hooksdream.app")
//!         .local_user_id("me")
//!         .auth_token("token")
//!         .build();
//!
//!     let providers = PlatformProviders::filesystem("/path/to/data", 50 * 1024 * 1024);
//!     let sdk = HooksDreamSDK::initialize_with_http(config, providers).await?;
//!     sdk.start()?;
//!
//!     let _dispose = sdk.on_status_change(|status| {
//!         println!("待同步: {}", status.pending_actions_count);
//!     });
//!
//!     sdk.toggle_follow("42").await?;
//!     sdk.queue_send_message("conversation-1", "Hello", "text").await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod network;
pub mod optimistic;
pub mod presence;
pub mod realtime;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use capability::{
    BadgeUpdate, Capability, CapabilityBroker, CapabilitySet, PermissionState, PlatformProviders, StorageUsage,
};
pub use error::{HooksDreamSDKError, Result};
pub use events::{ActionOutcome, Disposer, EventFilter, EventManager, MutationOutcome, SyncEvent};
pub use http_client::HttpTransport;
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{NetworkMonitor, NetworkStatus};
pub use optimistic::{NetworkOutcome, OptimisticCoordinator};
pub use presence::{PresenceCacheConfig, PresenceInfo, PresenceTracker};
pub use realtime::{ReconcileOutcome, RealtimeEvent, RealtimeReconciler};
pub use sdk::{HealthReport, HooksDreamSDK, HttpClientConfig, SdkConfig, SdkConfigBuilder, SyncStatus};
pub use storage::queue::{ActionKind, ActionPayload, EndpointDescriptor, HttpMethod, PendingAction, RetryPolicy};
pub use storage::{
    CachedConversation, CachedEntity, CachedMessage, CachedPost, CachedUser, CleanupPolicy, LocalEntityStore, QueryKey,
};
pub use sync::{ActionTransport, DrainReport, EnqueueResult, SyncDispatcher, TransportResponse};
pub use utils::Timestamp;
