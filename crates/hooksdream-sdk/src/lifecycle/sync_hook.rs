//! 同步模块生命周期 Hook
//!
//! - 回到前台：drain 待同步队列
//! - 切到后台：按队列里的操作类型注册后台同步 tag，释放屏幕常亮
//! - 后台同步时段：drain

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capability::CapabilityBroker;
use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::storage::queue::PendingActionLedger;
use crate::sync::SyncDispatcher;

pub struct SyncLifecycleHook {
    dispatcher: Arc<SyncDispatcher>,
    ledger: Arc<PendingActionLedger>,
    broker: Arc<CapabilityBroker>,
}

impl SyncLifecycleHook {
    pub fn new(dispatcher: Arc<SyncDispatcher>, ledger: Arc<PendingActionLedger>, broker: Arc<CapabilityBroker>) -> Self {
        Self {
            dispatcher,
            ledger,
            broker,
        }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        self.broker.release_wake_lock().await;

        let tags: BTreeSet<&'static str> = self
            .ledger
            .list()
            .await?
            .iter()
            .map(|action| action.kind().sync_tag())
            .collect();
        for tag in &tags {
            self.broker.register_background_sync(tag).await;
        }
        info!("[Sync Hook] App 切换到后台，已注册 {} 个后台同步 tag", tags.len());
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        let report = self.dispatcher.drain().await?;
        info!("[Sync Hook] ✅ 前台同步完成: {:?}", report);
        Ok(())
    }

    async fn on_sync_slot(&self, tag: &str) -> Result<()> {
        let report = self.dispatcher.drain().await?;
        debug!("[Sync Hook] 后台同步 {} 完成: {:?}", tag, report);
        Ok(())
    }
}
