//! 平台能力代理
//!
//! 启动时探测一次宿主平台的能力并缓存结果，运行期间只允许存储能力被降级。
//! 角标、屏幕常亮、后台同步注册属于建议性能力，失败只记录日志，不向调用方传播。

pub mod providers;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HooksDreamSDKError, Result};
use crate::events::{EventManager, SyncEvent};

pub use providers::{
    BackgroundSyncProvider, BadgeProvider, FsStorageProvider, HostBackgroundSync, InstallStateProvider,
    PlatformProviders, PushProvider, StorageProvider, Unsupported, WakeLockProvider,
};

/// 平台能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DurableStorage,
    BackgroundExecution,
    PushDelivery,
    Badging,
    WakeLock,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DurableStorage => "durable_storage",
            Capability::BackgroundExecution => "background_execution",
            Capability::PushDelivery => "push_delivery",
            Capability::Badging => "badging",
            Capability::WakeLock => "wake_lock",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 能力集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub durable_storage: bool,
    pub background_execution: bool,
    pub push_delivery: bool,
    pub badging: bool,
    pub wake_lock: bool,
}

impl CapabilitySet {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::DurableStorage => self.durable_storage,
            Capability::BackgroundExecution => self.background_execution,
            Capability::PushDelivery => self.push_delivery,
            Capability::Badging => self.badging,
            Capability::WakeLock => self.wake_lock,
        }
    }
}

/// 通知权限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Prompt,
    Unsupported,
}

/// 角标数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeUpdate {
    pub unread_messages: u32,
    pub notifications: u32,
    /// 显式总数，优先于两项之和
    pub total: Option<u32>,
}

impl BadgeUpdate {
    pub fn count(&self) -> u32 {
        self.total
            .unwrap_or_else(|| self.unread_messages.saturating_add(self.notifications))
    }
}

/// 存储用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used: u64,
    pub quota: u64,
    /// 0..=100
    pub percentage: f64,
}

impl StorageUsage {
    pub fn new(used: u64, quota: u64) -> Self {
        let percentage = if quota == 0 {
            0.0
        } else {
            used as f64 / quota as f64 * 100.0
        };
        Self { used, quota, percentage }
    }
}

/// 能力代理
pub struct CapabilityBroker {
    providers: PlatformProviders,
    events: Arc<EventManager>,
    detected: OnceLock<CapabilitySet>,
    storage_downgraded: AtomicBool,
    wake_lock_active: AtomicBool,
    notification_permission: Mutex<PermissionState>,
}

impl CapabilityBroker {
    pub fn new(providers: PlatformProviders, events: Arc<EventManager>) -> Self {
        Self {
            providers,
            events,
            detected: OnceLock::new(),
            storage_downgraded: AtomicBool::new(false),
            wake_lock_active: AtomicBool::new(false),
            notification_permission: Mutex::new(PermissionState::Prompt),
        }
    }

    /// 探测平台能力（只探测一次）
    pub fn detect(&self) -> CapabilitySet {
        *self.detected.get_or_init(|| {
            let set = CapabilitySet {
                durable_storage: self.providers.storage.is_persistent(),
                background_execution: self.providers.background_sync.is_supported(),
                push_delivery: self.providers.push.is_supported(),
                badging: self.providers.badge.is_supported(),
                wake_lock: self.providers.wake_lock.is_supported(),
            };
            info!("✅ 平台能力探测完成: {:?}", set);
            set
        })
    }

    /// 叠加运行期降级后的能力
    pub fn effective(&self) -> CapabilitySet {
        let mut set = self.detect();
        if self.storage_downgraded.load(Ordering::Acquire) {
            set.durable_storage = false;
        }
        set
    }

    pub fn is_available(&self, capability: Capability) -> bool {
        self.effective().has(capability)
    }

    /// 能力可用时执行 `f`，否则执行 `fallback`
    pub fn with_capability<R>(&self, capability: Capability, f: impl FnOnce() -> R, fallback: impl FnOnce() -> R) -> R {
        if self.is_available(capability) {
            f()
        } else {
            debug!("能力 {} 不可用，走降级路径", capability);
            fallback()
        }
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.is_available(capability) {
            Ok(())
        } else {
            Err(HooksDreamSDKError::CapabilityDenied(capability.to_string()))
        }
    }

    /// 存储不可用，降级为内存（只通知一次）
    pub fn downgrade_durable_storage(&self, reason: &str) {
        if self.storage_downgraded.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("⚠️ 持久存储已降级为内存: {}", reason);
        self.events.emit(SyncEvent::CapabilityDowngraded {
            capability: Capability::DurableStorage,
            reason: reason.to_string(),
        });
    }

    pub fn is_storage_downgraded(&self) -> bool {
        self.storage_downgraded.load(Ordering::Acquire)
    }

    /// 注册后台同步 tag；不支持或失败返回 false
    pub async fn register_background_sync(&self, tag: &str) -> bool {
        if !self.is_available(Capability::BackgroundExecution) {
            return false;
        }
        match self.providers.background_sync.register(tag).await {
            Ok(()) => {
                debug!("后台同步已注册: {}", tag);
                true
            }
            Err(e) => {
                warn!("⚠️ 后台同步注册失败 {}: {}", tag, e);
                false
            }
        }
    }

    /// 更新角标：数量为 0 时清除
    pub async fn update_badge(&self, update: BadgeUpdate) {
        if !self.is_available(Capability::Badging) {
            return;
        }
        let count = update.count();
        let result = if count > 0 {
            self.providers.badge.set_badge(count).await
        } else {
            self.providers.badge.clear_badge().await
        };
        if let Err(e) = result {
            warn!("⚠️ 角标更新失败: {}", e);
        }
    }

    pub async fn clear_badge(&self) {
        if !self.is_available(Capability::Badging) {
            return;
        }
        if let Err(e) = self.providers.badge.clear_badge().await {
            warn!("⚠️ 角标清除失败: {}", e);
        }
    }

    /// 请求屏幕常亮；已持有时直接返回 true
    pub async fn acquire_wake_lock(&self, reason: &str) -> bool {
        if !self.is_available(Capability::WakeLock) {
            return false;
        }
        if self.wake_lock_active.load(Ordering::Acquire) {
            return true;
        }
        match self.providers.wake_lock.acquire(reason).await {
            Ok(()) => {
                self.wake_lock_active.store(true, Ordering::Release);
                debug!("屏幕常亮已开启: {}", reason);
                true
            }
            Err(e) => {
                warn!("⚠️ 屏幕常亮请求失败: {}", e);
                false
            }
        }
    }

    pub async fn release_wake_lock(&self) {
        if !self.wake_lock_active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.providers.wake_lock.release().await {
            warn!("⚠️ 屏幕常亮释放失败: {}", e);
        }
    }

    pub fn is_wake_lock_active(&self) -> bool {
        self.wake_lock_active.load(Ordering::Acquire)
    }

    /// 请求通知权限；拒绝也只是记录状态
    pub async fn request_notification_permission(&self) -> PermissionState {
        let state = if !self.is_available(Capability::PushDelivery) {
            PermissionState::Unsupported
        } else {
            match self.providers.push.request_permission().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("⚠️ 通知权限请求失败: {}", e);
                    self.providers.push.permission_state().await
                }
            }
        };
        info!("通知权限: {:?}", state);
        *self.notification_permission.lock() = state;
        state
    }

    pub fn notification_permission(&self) -> PermissionState {
        if !self.detect().push_delivery {
            return PermissionState::Unsupported;
        }
        *self.notification_permission.lock()
    }

    pub fn has_notification_permission(&self) -> bool {
        self.notification_permission() == PermissionState::Granted
    }

    pub async fn storage_usage(&self) -> StorageUsage {
        match self.providers.storage.estimate().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("⚠️ 存储用量估算失败: {}", e);
                StorageUsage::default()
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.providers.install.is_installed()
    }

    pub fn is_installable(&self) -> bool {
        self.providers.install.is_installable()
    }
}
