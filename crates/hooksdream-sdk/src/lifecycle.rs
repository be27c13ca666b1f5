//! SDK 生命周期管理
//!
//! 管理 App 前后台切换和宿主分配的后台同步时段，统一触发各模块的状态切换。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;

    /// 宿主分配了一次后台同步时段
    async fn on_sync_slot(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: RwLock<Vec<Arc<dyn LifecycleHook>>>,
}

/// 生命周期阶段
#[derive(Debug, Clone, Copy)]
enum Phase<'a> {
    Background,
    Foreground,
    SyncSlot(&'a str),
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&self, hook: Arc<dyn LifecycleHook>) {
        let mut hooks = self.hooks.write();
        hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到后台");
        self.dispatch(Phase::Background).await
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到前台");
        self.dispatch(Phase::Foreground).await
    }

    /// 通知所有 Hook：后台同步时段
    pub async fn notify_sync_slot(&self, tag: &str) -> Result<()> {
        info!("🔄 后台同步时段: {}", tag);
        self.dispatch(Phase::SyncSlot(tag)).await
    }

    /// 按注册顺序执行；某个 Hook 失败时记录错误并继续，最后返回第一个错误
    async fn dispatch(&self, phase: Phase<'_>) -> Result<()> {
        let hooks: Vec<Arc<dyn LifecycleHook>> = self.hooks.read().clone();
        let mut errors = Vec::new();

        for (index, hook) in hooks.iter().enumerate() {
            let result = match phase {
                Phase::Background => hook.on_background().await,
                Phase::Foreground => hook.on_foreground().await,
                Phase::SyncSlot(tag) => hook.on_sync_slot(tag).await,
            };
            if let Err(e) = result {
                warn!("⚠️ Hook #{} 处理 {:?} 失败: {}", index, phase, e);
                errors.push(e);
            }
        }

        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 同步 Hook（SDK 内部自动注册）
mod sync_hook;
pub use sync_hook::SyncLifecycleHook;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HooksDreamSDKError;
    use parking_lot::Mutex;

    struct RecordingHook {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_background: bool,
    }

    #[async_trait]
    impl LifecycleHook for RecordingHook {
        async fn on_background(&self) -> Result<()> {
            self.log.lock().push(format!("{}:background", self.name));
            if self.fail_background {
                return Err(HooksDreamSDKError::Other("boom".to_string()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.log.lock().push(format!("{}:foreground", self.name));
            Ok(())
        }

        async fn on_sync_slot(&self, tag: &str) -> Result<()> {
            self.log.lock().push(format!("{}:{}", self.name, tag));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register_hook(Arc::new(RecordingHook {
            name: "a",
            log: log.clone(),
            fail_background: true,
        }));
        manager.register_hook(Arc::new(RecordingHook {
            name: "b",
            log: log.clone(),
            fail_background: false,
        }));

        assert!(manager.notify_background().await.is_err());
        manager.notify_foreground().await.unwrap();
        manager.notify_sync_slot("background-sync-posts").await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "a:background",
                "b:background",
                "a:foreground",
                "b:foreground",
                "a:background-sync-posts",
                "b:background-sync-posts",
            ]
        );
    }
}
