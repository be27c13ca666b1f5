//! 待同步操作队列
//!
//! 离线时用户的写操作（发帖、私信、点赞、关注、上传）在这里持久化，
//! 联网后由 `SyncDispatcher` 按入队顺序回放。
//!
//! - 入队在返回前已落盘（持久后端）
//! - `list()` 严格按创建顺序（自增 seq 列）
//! - 这一层不做去重

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{HooksDreamSDKError, Result};
use crate::events::{ActionOutcome, SyncEvent};
use crate::storage::backend::{EntityBackend, StoredAction};
use crate::storage::LocalEntityStore;
use crate::utils::now_millis;

pub mod action;
pub mod retry_policy;

pub use action::{
    ActionId, ActionKind, ActionPayload, BodyEncoding, CreatePostPayload, EndpointDescriptor, FollowUserPayload, HttpMethod,
    LikePostPayload, PendingAction, SendMessagePayload, UploadImagePayload,
};
pub use retry_policy::{FailureReason, RetryPolicy};

/// 待同步操作账本
pub struct PendingActionLedger {
    store: Arc<LocalEntityStore>,
}

impl PendingActionLedger {
    pub fn new(store: Arc<LocalEntityStore>) -> Self {
        Self { store }
    }

    /// 入队，返回带 id 的操作
    pub async fn enqueue(&self, payload: ActionPayload, target: EndpointDescriptor) -> Result<PendingAction> {
        let action = PendingAction::new(payload, target);
        self.insert(&action).await?;
        info!("📥 操作已入队: {} ({})", action.id, action.kind());
        self.store.events().emit(SyncEvent::ActionQueued {
            action_id: action.id.clone(),
            kind: action.kind(),
        });
        Ok(action)
    }

    /// 写入一条已构造好的操作（保留 retry_count 等字段）
    pub(crate) async fn insert(&self, action: &PendingAction) -> Result<()> {
        let stored = encode(action)?;
        let stored = &stored;
        self.store.run(|b| async move { b.insert_action(stored).await }).await
    }

    /// 按创建顺序列出；无法解析的行会被移除并以失败结算
    pub async fn list(&self) -> Result<Vec<PendingAction>> {
        let rows = self.store.run(|b| async move { b.list_actions().await }).await?;
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            match decode(&row) {
                Ok(action) => actions.push(action),
                Err(e) => self.discard_malformed(&row, e).await?,
            }
        }
        Ok(actions)
    }

    async fn discard_malformed(&self, row: &StoredAction, error: HooksDreamSDKError) -> Result<()> {
        warn!("⚠️ 丢弃无法解析的操作 {}: {}", row.id, error);
        let id = row.id.as_str();
        self.store.run(|b| async move { b.remove_action(id).await }).await?;
        let event = match ActionKind::parse(&row.kind) {
            Some(kind) => SyncEvent::ActionSettled {
                action_id: row.id.clone(),
                kind,
                outcome: ActionOutcome::Failed {
                    reason: error.to_string(),
                    status: None,
                },
                timestamp: now_millis(),
            },
            None => SyncEvent::ActionDiscarded {
                action_id: row.id.clone(),
                kind: row.kind.clone(),
                reason: error.to_string(),
                timestamp: now_millis(),
            },
        };
        self.store.events().emit(event);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingAction>> {
        match self.store.run(|b| async move { b.get_action(id).await }).await? {
            Some(row) => match decode(&row) {
                Ok(action) => Ok(Some(action)),
                Err(e) => {
                    self.discard_malformed(&row, e).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.store.run(|b| async move { b.get_action(id).await }).await?.is_some())
    }

    /// 记录一次失败；返回更新后的操作，操作已不在队列中时返回 None
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Option<PendingAction>> {
        let attempted_at = now_millis();
        let retry_count = self
            .store
            .run(|b| async move { b.mark_action_failed(id, attempted_at, error).await })
            .await?;
        match retry_count {
            Some(count) => {
                debug!("操作 {} 第 {} 次失败: {}", id, count, error);
                self.get(id).await
            }
            None => Ok(None),
        }
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.run(|b| async move { b.remove_action(id).await }).await
    }

    pub async fn list_by_kind(&self, kind: ActionKind) -> Result<Vec<PendingAction>> {
        Ok(self.list().await?.into_iter().filter(|a| a.kind() == kind).collect())
    }

    /// 至少失败过一次的操作
    pub async fn list_failed(&self) -> Result<Vec<PendingAction>> {
        Ok(self.list().await?.into_iter().filter(|a| a.retry_count > 0).collect())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.run(|b| async move { b.list_actions().await }).await?.len())
    }

    pub async fn clear(&self) -> Result<usize> {
        let removed = self.store.run(|b| async move { b.clear_actions().await }).await?;
        info!("🗑️ 已清空待同步队列: {} 条", removed);
        Ok(removed)
    }
}

fn encode(action: &PendingAction) -> Result<StoredAction> {
    Ok(StoredAction {
        id: action.id.clone(),
        kind: action.kind().as_str().to_string(),
        payload: serde_json::to_string(&action.payload)?,
        target: serde_json::to_string(&action.target)?,
        retry_count: action.retry_count,
        created_at: action.created_at,
        last_attempt: action.last_attempt,
        last_error: action.last_error.clone(),
    })
}

fn decode(row: &StoredAction) -> Result<PendingAction> {
    let payload: ActionPayload = serde_json::from_str(&row.payload)?;
    if payload.kind().as_str() != row.kind {
        return Err(HooksDreamSDKError::Serialization(format!(
            "操作类型不一致: 列 {} / 内容 {}",
            row.kind,
            payload.kind()
        )));
    }
    Ok(PendingAction {
        id: row.id.clone(),
        payload,
        target: serde_json::from_str(&row.target)?,
        retry_count: row.retry_count,
        created_at: row.created_at,
        last_attempt: row.last_attempt,
        last_error: row.last_error.clone(),
    })
}
