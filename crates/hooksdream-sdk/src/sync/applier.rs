//! 服务端响应应用器
//!
//! 操作确认后，把服务端返回的权威数据写回缓存（服务端优先）。
//! 服务端响应为 `{ success, data }` 信封，这里只取 `data`。
//! 写入时间戳为 `max(now, cached + 1)`，保证覆盖乐观值。

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::queue::{ActionPayload, PendingAction};
use crate::storage::{EntityTable, LocalEntityStore, PatchOutcome, RawEntity};
use crate::utils::stamp_after;

/// 服务端响应应用器
pub struct ServerResponseApplier {
    store: Arc<LocalEntityStore>,
}

/// 取出 `{ success, data }` 信封中的数据；没有信封时原样返回
pub fn unwrap_envelope(body: &Value) -> Option<&Value> {
    match body.get("data") {
        Some(data) if body.get("success").is_some() => Some(data),
        _ if body.is_object() => Some(body),
        _ => None,
    }
}

fn pick(data: &Value, fields: &[(&str, &[&str])]) -> Map<String, Value> {
    let mut patch = Map::new();
    for (target, sources) in fields {
        if let Some(v) = sources.iter().find_map(|s| data.get(*s)).filter(|v| !v.is_null()) {
            patch.insert(target.to_string(), v.clone());
        }
    }
    patch
}

impl ServerResponseApplier {
    pub fn new(store: Arc<LocalEntityStore>) -> Self {
        Self { store }
    }

    /// 应用确认响应
    pub async fn on_confirmed(&self, action: &PendingAction, body: Option<&Value>) -> Result<()> {
        let Some(data) = body.and_then(unwrap_envelope) else {
            debug!("操作 {} 无响应数据，保留乐观值", action.id);
            return Ok(());
        };

        match &action.payload {
            ActionPayload::FollowUser(p) => {
                let patch = pick(
                    data,
                    &[("isFollowing", &["isFollowing"]), ("followerCount", &["followerCount", "followersCount"])],
                );
                self.patch(EntityTable::Users, &p.user_id, patch).await
            }
            ActionPayload::LikePost(p) => {
                let patch = pick(data, &[("isLiked", &["isLiked"]), ("likesCount", &["likesCount", "likeCount"])]);
                self.patch(EntityTable::Posts, &p.post_id, patch).await
            }
            ActionPayload::CreatePost(p) => {
                let entity = data.get("post").unwrap_or(data);
                self.replace_placeholder(EntityTable::Posts, p.client_id.as_deref(), entity).await
            }
            ActionPayload::SendMessage(p) => {
                let entity = data.get("message").unwrap_or(data);
                self.replace_placeholder(EntityTable::Messages, p.client_id.as_deref(), entity).await
            }
            ActionPayload::UploadImage(_) => Ok(()),
        }
    }

    /// 永久失败：把乐观占位条目标记为 failed
    pub async fn on_failed(&self, action: &PendingAction) -> Result<()> {
        let (table, client_id) = match &action.payload {
            ActionPayload::CreatePost(p) => (EntityTable::Posts, p.client_id.as_deref()),
            ActionPayload::SendMessage(p) => (EntityTable::Messages, p.client_id.as_deref()),
            _ => return Ok(()),
        };
        let Some(client_id) = client_id else {
            return Ok(());
        };
        let current = self.store.get_raw(table, client_id).await?.map(|e| e.updated_at);
        self.store
            .merge_patch(table, client_id, &json!({ "status": "failed" }), stamp_after(current))
            .await?;
        Ok(())
    }

    async fn patch(&self, table: EntityTable, key: &str, patch: Map<String, Value>) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let current = self.store.get_raw(table, key).await?.map(|e| e.updated_at);
        let outcome = self
            .store
            .merge_patch(table, key, &Value::Object(patch), stamp_after(current))
            .await?;
        if outcome != PatchOutcome::Applied {
            debug!("{}/{} 未应用服务端数据: {:?}", table, key, outcome);
        }
        Ok(())
    }

    async fn replace_placeholder(&self, table: EntityTable, client_id: Option<&str>, data: &Value) -> Result<()> {
        let current = match data.get("_id").and_then(Value::as_str) {
            Some(id) => self.store.get_raw(table, id).await?.map(|e| e.updated_at),
            None => None,
        };
        let entity = match RawEntity::from_value(table, data.clone(), stamp_after(current)) {
            Ok(entity) => entity,
            Err(e) => {
                warn!("⚠️ 服务端返回的 {} 数据无法解析，保留占位条目: {}", table, e);
                return Ok(());
            }
        };

        self.store.put_raw(table, &entity).await?;
        if let Some(client_id) = client_id.filter(|id| *id != entity.key) {
            self.store.delete(table, client_id).await?;
        }
        Ok(())
    }
}
