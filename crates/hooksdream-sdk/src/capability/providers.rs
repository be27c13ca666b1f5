//! 平台能力提供者
//!
//! 宿主平台在构造 SDK 时注入这些实现。每个 trait 都有 `Unsupported` 实现，
//! 所有依赖方都必须能在能力缺失时正常工作。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use crate::capability::{PermissionState, StorageUsage};
use crate::error::{HooksDreamSDKError, Result};

/// 持久存储
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// 能否持久化
    fn is_persistent(&self) -> bool;

    /// 已用空间 / 配额
    async fn estimate(&self) -> Result<StorageUsage>;
}

/// 后台同步（宿主在合适的时机回调 `notify_sync_slot`）
#[async_trait]
pub trait BackgroundSyncProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn register(&self, tag: &str) -> Result<()>;
}

/// 推送
#[async_trait]
pub trait PushProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn permission_state(&self) -> PermissionState;

    async fn request_permission(&self) -> Result<PermissionState>;
}

/// 应用图标角标
#[async_trait]
pub trait BadgeProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn set_badge(&self, count: u32) -> Result<()>;

    async fn clear_badge(&self) -> Result<()>;
}

/// 屏幕常亮
#[async_trait]
pub trait WakeLockProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn acquire(&self, reason: &str) -> Result<()>;

    async fn release(&self) -> Result<()>;
}

/// 安装状态
pub trait InstallStateProvider: Send + Sync {
    fn is_installed(&self) -> bool;

    fn is_installable(&self) -> bool;
}

/// 不支持的能力
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

fn unsupported(what: &str) -> HooksDreamSDKError {
    HooksDreamSDKError::CapabilityDenied(format!("{} 不可用", what))
}

#[async_trait]
impl StorageProvider for Unsupported {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn estimate(&self) -> Result<StorageUsage> {
        Ok(StorageUsage::new(0, 0))
    }
}

#[async_trait]
impl BackgroundSyncProvider for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    async fn register(&self, _tag: &str) -> Result<()> {
        Err(unsupported("background sync"))
    }
}

#[async_trait]
impl PushProvider for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    async fn permission_state(&self) -> PermissionState {
        PermissionState::Unsupported
    }

    async fn request_permission(&self) -> Result<PermissionState> {
        Ok(PermissionState::Unsupported)
    }
}

#[async_trait]
impl BadgeProvider for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    async fn set_badge(&self, _count: u32) -> Result<()> {
        Err(unsupported("badge"))
    }

    async fn clear_badge(&self) -> Result<()> {
        Err(unsupported("badge"))
    }
}

#[async_trait]
impl WakeLockProvider for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    async fn acquire(&self, _reason: &str) -> Result<()> {
        Err(unsupported("wake lock"))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

impl InstallStateProvider for Unsupported {
    fn is_installed(&self) -> bool {
        false
    }

    fn is_installable(&self) -> bool {
        false
    }
}

/// 基于数据目录的存储估算（遍历目录累计文件大小）
#[derive(Debug, Clone)]
pub struct FsStorageProvider {
    root: PathBuf,
    quota: u64,
}

impl FsStorageProvider {
    pub fn new(root: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            root: root.into(),
            quota,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[async_trait]
impl StorageProvider for FsStorageProvider {
    fn is_persistent(&self) -> bool {
        std::fs::create_dir_all(&self.root).is_ok()
    }

    async fn estimate(&self) -> Result<StorageUsage> {
        let root = self.root.clone();
        let used = tokio::task::spawn_blocking(move || directory_size(&root))
            .await
            .map_err(|e| HooksDreamSDKError::IO(format!("统计存储用量失败: {}", e)))?;
        debug!("存储用量: {} / {} bytes", used, self.quota);
        Ok(StorageUsage::new(used, self.quota))
    }
}

/// 由宿主驱动的后台同步：只记录注册过的 tag，宿主在后台时段调用 `notify_sync_slot`
#[derive(Debug, Default)]
pub struct HostBackgroundSync {
    registered: Mutex<BTreeSet<String>>,
}

impl HostBackgroundSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_tags(&self) -> Vec<String> {
        self.registered.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl BackgroundSyncProvider for HostBackgroundSync {
    fn is_supported(&self) -> bool {
        true
    }

    async fn register(&self, tag: &str) -> Result<()> {
        self.registered.lock().insert(tag.to_string());
        Ok(())
    }
}

/// 注入 SDK 的能力集合
#[derive(Clone)]
pub struct PlatformProviders {
    pub storage: Arc<dyn StorageProvider>,
    pub background_sync: Arc<dyn BackgroundSyncProvider>,
    pub push: Arc<dyn PushProvider>,
    pub badge: Arc<dyn BadgeProvider>,
    pub wake_lock: Arc<dyn WakeLockProvider>,
    pub install: Arc<dyn InstallStateProvider>,
}

impl PlatformProviders {
    /// 所有能力都不可用
    pub fn unsupported() -> Self {
        Self {
            storage: Arc::new(Unsupported),
            background_sync: Arc::new(Unsupported),
            push: Arc::new(Unsupported),
            badge: Arc::new(Unsupported),
            wake_lock: Arc::new(Unsupported),
            install: Arc::new(Unsupported),
        }
    }

    /// 桌面 / 服务端宿主：本地目录持久化，后台同步由宿主驱动
    pub fn filesystem(root: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            storage: Arc::new(FsStorageProvider::new(root, quota)),
            background_sync: Arc::new(HostBackgroundSync::new()),
            ..Self::unsupported()
        }
    }

    pub fn with_storage(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.storage = provider;
        self
    }

    pub fn with_background_sync(mut self, provider: Arc<dyn BackgroundSyncProvider>) -> Self {
        self.background_sync = provider;
        self
    }

    pub fn with_push(mut self, provider: Arc<dyn PushProvider>) -> Self {
        self.push = provider;
        self
    }

    pub fn with_badge(mut self, provider: Arc<dyn BadgeProvider>) -> Self {
        self.badge = provider;
        self
    }

    pub fn with_wake_lock(mut self, provider: Arc<dyn WakeLockProvider>) -> Self {
        self.wake_lock = provider;
        self
    }

    pub fn with_install_state(mut self, provider: Arc<dyn InstallStateProvider>) -> Self {
        self.install = provider;
        self
    }
}

impl Default for PlatformProviders {
    fn default() -> Self {
        Self::unsupported()
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    /// 声称支持但每次调用都失败的角标
    #[derive(Default)]
    pub struct FailingBadge {
        pub calls: Mutex<u32>,
    }

    #[async_trait]
    impl BadgeProvider for FailingBadge {
        fn is_supported(&self) -> bool {
            true
        }

        async fn set_badge(&self, _count: u32) -> Result<()> {
            *self.calls.lock() += 1;
            Err(HooksDreamSDKError::Other("badge backend crashed".to_string()))
        }

        async fn clear_badge(&self) -> Result<()> {
            *self.calls.lock() += 1;
            Err(HooksDreamSDKError::Other("badge backend crashed".to_string()))
        }
    }

    /// 声称支持但获取总是失败的屏幕常亮
    pub struct FailingWakeLock;

    #[async_trait]
    impl WakeLockProvider for FailingWakeLock {
        fn is_supported(&self) -> bool {
            true
        }

        async fn acquire(&self, _reason: &str) -> Result<()> {
            Err(HooksDreamSDKError::Other("screen lock refused".to_string()))
        }

        async fn release(&self) -> Result<()> {
            Err(HooksDreamSDKError::Other("screen lock refused".to_string()))
        }
    }

    /// 记录角标数值
    #[derive(Default)]
    pub struct RecordingBadge {
        pub values: Mutex<Vec<Option<u32>>>,
    }

    #[async_trait]
    impl BadgeProvider for RecordingBadge {
        fn is_supported(&self) -> bool {
            true
        }

        async fn set_badge(&self, count: u32) -> Result<()> {
            self.values.lock().push(Some(count));
            Ok(())
        }

        async fn clear_badge(&self) -> Result<()> {
            self.values.lock().push(None);
            Ok(())
        }
    }

    /// 支持推送，权限请求返回固定结果
    pub struct FixedPush(pub PermissionState);

    #[async_trait]
    impl PushProvider for FixedPush {
        fn is_supported(&self) -> bool {
            true
        }

        async fn permission_state(&self) -> PermissionState {
            PermissionState::Prompt
        }

        async fn request_permission(&self) -> Result<PermissionState> {
            Ok(self.0)
        }
    }
}
