//! 实时推送协调器
//!
//! 双工通道收到的推送先发布为 `RealtimeReceived`，这里订阅后映射为内部事件并写入缓存：
//!
//! | 推送 | 内部事件 |
//! |---|---|
//! | `post:liked` | EntityLiked |
//! | `post:created` / `message:new` | EntityCreated |
//! | `post:deleted` / `message:deleted` | EntityDeleted |
//! | `post:edited` / `user:follow:update` | EntityEdited |
//! | `chat:user:status` | PresenceChanged |
//!
//! 写入遵循单调规则；本地用户自己的操作仍在进行中时，服务端回声直接丢弃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HooksDreamSDKError, Result};
use crate::events::{EventFilter, EventManager, SyncEvent};
use crate::optimistic::InFlightRegistry;
use crate::presence::PresenceTracker;
use crate::storage::{EntityTable, LocalEntityStore, PatchOutcome, QueryKey, RawEntity};
use crate::utils::{now_millis, parse_timestamp, Timestamp};

/// 推送的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// 缓存中的值更新
    Stale,
    /// 本地操作的回声
    SuppressedEcho,
    /// 目标条目不在缓存中
    NotCached,
    /// 未知事件或格式错误
    Ignored,
}

impl From<PatchOutcome> for ReconcileOutcome {
    fn from(outcome: PatchOutcome) -> Self {
        match outcome {
            PatchOutcome::Applied => ReconcileOutcome::Applied,
            PatchOutcome::Stale => ReconcileOutcome::Stale,
            PatchOutcome::Missing => ReconcileOutcome::NotCached,
        }
    }
}

/// 内部事件
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    EntityLiked {
        post_id: String,
        actor_id: Option<String>,
        is_liked: Option<bool>,
        likes_count: Option<i64>,
    },
    EntityCreated {
        table: EntityTable,
        actor_id: Option<String>,
        entity: Value,
    },
    EntityDeleted {
        table: EntityTable,
        key: String,
        actor_id: Option<String>,
    },
    EntityEdited {
        table: EntityTable,
        key: String,
        actor_id: Option<String>,
        patch: Value,
    },
    PresenceChanged {
        user_id: String,
        is_online: bool,
    },
}

impl RealtimeEvent {
    /// 触发事件的用户
    pub fn actor_id(&self) -> Option<&str> {
        match self {
            RealtimeEvent::EntityLiked { actor_id, .. }
            | RealtimeEvent::EntityCreated { actor_id, .. }
            | RealtimeEvent::EntityDeleted { actor_id, .. }
            | RealtimeEvent::EntityEdited { actor_id, .. } => actor_id.as_deref(),
            RealtimeEvent::PresenceChanged { user_id, .. } => Some(user_id),
        }
    }

    /// 事件影响的缓存条目
    pub fn query_key(&self) -> Option<QueryKey> {
        match self {
            RealtimeEvent::EntityLiked { post_id, .. } => Some(QueryKey::post(post_id.clone())),
            RealtimeEvent::EntityCreated { table, entity, .. } => entity
                .get("_id")
                .and_then(Value::as_str)
                .map(|id| QueryKey::new(*table, id)),
            RealtimeEvent::EntityDeleted { table, key, .. } | RealtimeEvent::EntityEdited { table, key, .. } => {
                Some(QueryKey::new(*table, key.clone()))
            }
            RealtimeEvent::PresenceChanged { .. } => None,
        }
    }
}

// ========== 推送格式 ==========

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostLikedWire {
    post_id: String,
    user_id: Option<String>,
    is_liked: Option<bool>,
    #[serde(alias = "likesCount")]
    like_count: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostCreatedWire {
    post: Value,
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageNewWire {
    conversation_id: Option<String>,
    message: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostDeletedWire {
    post_id: String,
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeletedWire {
    message_id: String,
    deleted_by: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostEditedWire {
    post_id: Option<String>,
    user_id: Option<String>,
    post: Option<Value>,
    content: Option<String>,
    images: Option<Vec<String>>,
    edited_at: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowUpdateWire {
    follower_id: String,
    following_id: Option<String>,
    target_user_id: Option<String>,
    is_following: bool,
    #[serde(alias = "followersCount")]
    follower_count: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserStatusWire {
    user_id: String,
    status: String,
}

fn decode<T: DeserializeOwned>(event_type: &str, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| HooksDreamSDKError::Serialization(format!("{} 推送格式错误: {}", event_type, e)))
}

fn malformed(event_type: &str, what: &str) -> HooksDreamSDKError {
    HooksDreamSDKError::Serialization(format!("{} 推送缺少 {}", event_type, what))
}

/// 取出引用字段的 id：可能是字符串，也可能是带 `_id` / `hashId` 的对象
fn reference_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("hashId")
            .or_else(|| map.get("_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// 把推送映射为内部事件；未知事件返回 None
///
/// `local_user_id` 决定是否同步 `isLiked` / `isFollowing` 这类只对本人有意义的字段。
pub fn parse_event(event_type: &str, payload: &Value, local_user_id: Option<&str>) -> Result<Option<RealtimeEvent>> {
    let is_local = |actor: Option<&str>| local_user_id.is_some() && actor == local_user_id;

    let event = match event_type {
        "post:liked" => {
            let wire: PostLikedWire = decode(event_type, payload)?;
            RealtimeEvent::EntityLiked {
                post_id: wire.post_id,
                actor_id: wire.user_id,
                is_liked: wire.is_liked,
                likes_count: wire.like_count,
            }
        }
        "post:created" => {
            let wire: PostCreatedWire = decode(event_type, payload)?;
            let actor_id = wire
                .user_id
                .or_else(|| wire.post.get("author").and_then(reference_id));
            RealtimeEvent::EntityCreated {
                table: EntityTable::Posts,
                actor_id,
                entity: wire.post,
            }
        }
        "message:new" => {
            let wire: MessageNewWire = decode(event_type, payload)?;
            let Value::Object(mut message) = wire.message else {
                return Err(malformed(event_type, "message"));
            };
            if !message.contains_key("conversationId") {
                let conversation = message
                    .get("conversation")
                    .and_then(reference_id)
                    .or(wire.conversation_id)
                    .ok_or_else(|| malformed(event_type, "conversationId"))?;
                message.insert("conversationId".to_string(), Value::String(conversation));
            }
            if !message.contains_key("senderId") {
                if let Some(sender) = message.get("sender").and_then(reference_id) {
                    message.insert("senderId".to_string(), Value::String(sender));
                }
            }
            let actor_id = message.get("senderId").and_then(Value::as_str).map(str::to_string);
            RealtimeEvent::EntityCreated {
                table: EntityTable::Messages,
                actor_id,
                entity: Value::Object(message),
            }
        }
        "post:deleted" => {
            let wire: PostDeletedWire = decode(event_type, payload)?;
            RealtimeEvent::EntityDeleted {
                table: EntityTable::Posts,
                key: wire.post_id,
                actor_id: wire.user_id,
            }
        }
        "message:deleted" => {
            let wire: MessageDeletedWire = decode(event_type, payload)?;
            RealtimeEvent::EntityDeleted {
                table: EntityTable::Messages,
                key: wire.message_id,
                actor_id: wire.deleted_by,
            }
        }
        "post:edited" => {
            let wire: PostEditedWire = decode(event_type, payload)?;
            let key = wire
                .post_id
                .clone()
                .or_else(|| wire.post.as_ref().and_then(|p| p.get("_id")).and_then(Value::as_str).map(str::to_string))
                .ok_or_else(|| malformed(event_type, "postId"))?;
            let patch = match wire.post {
                Some(post) => post,
                None => {
                    let mut patch = Map::new();
                    if let Some(content) = wire.content {
                        patch.insert("content".to_string(), Value::String(content));
                    }
                    if let Some(images) = wire.images {
                        patch.insert("images".to_string(), json!(images));
                    }
                    let edited_at = wire
                        .edited_at
                        .as_ref()
                        .and_then(parse_timestamp)
                        .or_else(|| payload.get("timestamp").and_then(parse_timestamp));
                    if let Some(edited_at) = edited_at {
                        patch.insert("editedAt".to_string(), json!(edited_at));
                    }
                    Value::Object(patch)
                }
            };
            RealtimeEvent::EntityEdited {
                table: EntityTable::Posts,
                key,
                actor_id: wire.user_id,
                patch,
            }
        }
        "user:follow:update" => {
            let wire: FollowUpdateWire = decode(event_type, payload)?;
            let target = wire
                .following_id
                .or(wire.target_user_id)
                .ok_or_else(|| malformed(event_type, "followingId"))?;
            let mut patch = Map::new();
            if let Some(count) = wire.follower_count {
                patch.insert("followerCount".to_string(), json!(count));
            }
            if is_local(Some(&wire.follower_id)) {
                patch.insert("isFollowing".to_string(), Value::Bool(wire.is_following));
            }
            RealtimeEvent::EntityEdited {
                table: EntityTable::Users,
                key: target,
                actor_id: Some(wire.follower_id),
                patch: Value::Object(patch),
            }
        }
        "chat:user:status" => {
            let wire: UserStatusWire = decode(event_type, payload)?;
            RealtimeEvent::PresenceChanged {
                user_id: wire.user_id,
                is_online: wire.status == "online",
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// 实时推送协调器
pub struct RealtimeReconciler {
    store: Arc<LocalEntityStore>,
    events: Arc<EventManager>,
    registry: Arc<InFlightRegistry>,
    presence: PresenceTracker,
    local_user_id: RwLock<Option<String>>,
    shutdown_signal: Notify,
    is_running: AtomicBool,
}

impl RealtimeReconciler {
    pub fn new(
        store: Arc<LocalEntityStore>,
        events: Arc<EventManager>,
        registry: Arc<InFlightRegistry>,
        local_user_id: Option<String>,
    ) -> Self {
        Self {
            store,
            events,
            registry,
            presence: PresenceTracker::new(),
            local_user_id: RwLock::new(local_user_id),
            shutdown_signal: Notify::new(),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn set_local_user(&self, user_id: Option<String>) {
        *self.local_user_id.write() = user_id;
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.local_user_id.read().clone()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// 处理一条推送
    pub async fn on_event(&self, event_type: &str, payload: &Value) -> Result<ReconcileOutcome> {
        let local_user = self.local_user_id();
        let event = match parse_event(event_type, payload, local_user.as_deref()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("忽略未知推送: {}", event_type);
                return Ok(ReconcileOutcome::Ignored);
            }
            Err(e) => {
                warn!("⚠️ 忽略推送 {}: {}", event_type, e);
                return Ok(ReconcileOutcome::Ignored);
            }
        };
        let timestamp = payload
            .get("timestamp")
            .and_then(parse_timestamp)
            .unwrap_or_else(now_millis);

        let is_local_actor = local_user.is_some() && event.actor_id() == local_user.as_deref();
        if is_local_actor {
            if let Some(key) = event.query_key() {
                if self.registry.is_in_flight(&key) {
                    debug!("丢弃本地操作的回声: {} {}", event_type, key);
                    return Ok(ReconcileOutcome::SuppressedEcho);
                }
            }
        }

        let outcome = self.apply(event, timestamp, is_local_actor).await?;
        debug!("📥 推送 {} -> {:?}", event_type, outcome);
        Ok(outcome)
    }

    async fn apply(&self, event: RealtimeEvent, timestamp: Timestamp, is_local_actor: bool) -> Result<ReconcileOutcome> {
        match event {
            RealtimeEvent::EntityLiked {
                post_id,
                is_liked,
                likes_count,
                ..
            } => {
                let mut patch = Map::new();
                if let Some(count) = likes_count {
                    patch.insert("likesCount".to_string(), json!(count));
                }
                if is_local_actor {
                    if let Some(liked) = is_liked {
                        patch.insert("isLiked".to_string(), Value::Bool(liked));
                    }
                }
                self.patch(EntityTable::Posts, &post_id, patch, timestamp).await
            }
            RealtimeEvent::EntityCreated { table, entity, .. } => {
                let entity = match RawEntity::from_value(table, entity, timestamp) {
                    Ok(entity) => entity,
                    Err(e) => {
                        warn!("⚠️ 推送的 {} 无法解析: {}", table, e);
                        return Ok(ReconcileOutcome::Ignored);
                    }
                };
                if self.store.put_raw(table, &entity).await? {
                    Ok(ReconcileOutcome::Applied)
                } else {
                    Ok(ReconcileOutcome::Stale)
                }
            }
            RealtimeEvent::EntityDeleted { table, key, .. } => {
                Ok(self.store.delete_as_of(table, &key, timestamp).await?.into())
            }
            RealtimeEvent::EntityEdited { table, key, patch, .. } => match patch {
                Value::Object(patch) => self.patch(table, &key, patch, timestamp).await,
                _ => Ok(ReconcileOutcome::Ignored),
            },
            RealtimeEvent::PresenceChanged { user_id, is_online } => {
                if !self.presence.update(&user_id, is_online, timestamp) {
                    return Ok(ReconcileOutcome::Stale);
                }
                let mut patch = Map::new();
                patch.insert("isOnline".to_string(), Value::Bool(is_online));
                if !is_online {
                    patch.insert("lastSeen".to_string(), json!(timestamp));
                }
                // 用户不在缓存时只更新在线状态表
                self.store
                    .merge_patch(EntityTable::Users, &user_id, &Value::Object(patch), timestamp)
                    .await?;
                Ok(ReconcileOutcome::Applied)
            }
        }
    }

    async fn patch(
        &self,
        table: EntityTable,
        key: &str,
        patch: Map<String, Value>,
        timestamp: Timestamp,
    ) -> Result<ReconcileOutcome> {
        if patch.is_empty() {
            return Ok(ReconcileOutcome::Ignored);
        }
        Ok(self
            .store
            .merge_patch(table, key, &Value::Object(patch), timestamp)
            .await?
            .into())
    }

    /// 订阅事件总线上的 `RealtimeReceived`
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(HooksDreamSDKError::Other("实时推送协调器已在运行".to_string()));
        }
        let mut receiver = self
            .events
            .subscribe_filtered(EventFilter::new().with_event_types(vec!["realtime_received".to_string()]));
        let this = self.clone();

        Ok(tokio::spawn(async move {
            info!("🚀 实时推送协调器已启动");
            loop {
                tokio::select! {
                    _ = this.shutdown_signal.notified() => break,
                    event = receiver.recv() => match event {
                        Some(SyncEvent::RealtimeReceived { event_type, payload }) => {
                            if let Err(e) = this.on_event(&event_type, &payload).await {
                                warn!("⚠️ 处理推送 {} 失败: {}", event_type, e);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            this.is_running.store(false, Ordering::SeqCst);
            info!("实时推送协调器已停止");
        }))
    }

    pub fn shutdown(&self) {
        if self.is_running.load(Ordering::SeqCst) {
            self.shutdown_signal.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CachedEntity, CachedMessage, CachedPost, CachedUser, PostAuthor};
    use std::time::Duration;

    struct Harness {
        store: Arc<LocalEntityStore>,
        events: Arc<EventManager>,
        registry: Arc<InFlightRegistry>,
        reconciler: Arc<RealtimeReconciler>,
    }

    async fn harness() -> Harness {
        let events = Arc::new(EventManager::new(64));
        let store = Arc::new(LocalEntityStore::in_memory(events.clone()).await.unwrap());
        let registry = InFlightRegistry::new();
        let reconciler = Arc::new(RealtimeReconciler::new(
            store.clone(),
            events.clone(),
            registry.clone(),
            Some("me".to_string()),
        ));
        Harness {
            store,
            events,
            registry,
            reconciler,
        }
    }

    fn post(likes: i64, liked: bool) -> CachedPost {
        CachedPost {
            id: "p1".to_string(),
            author: PostAuthor {
                hash_id: "ann".to_string(),
                username: "ann".to_string(),
                avatar: None,
            },
            content: "hello".to_string(),
            images: vec![],
            likes_count: likes,
            is_liked: liked,
            comments_count: 0,
            created_at: 1,
            edited_at: None,
        }
    }

    fn user(followers: i64) -> CachedUser {
        CachedUser {
            hash_id: "42".to_string(),
            username: "neo".to_string(),
            full_name: None,
            avatar: None,
            bio: None,
            is_following: false,
            follower_count: followers,
            following_count: 0,
            is_online: false,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn test_like_from_other_user_updates_count_only() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(post(3, false), 100)).await.unwrap();

        let outcome = h
            .reconciler
            .on_event(
                "post:liked",
                &json!({ "postId": "p1", "userId": "bob", "isLiked": true, "likeCount": 4, "timestamp": 200 }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let cached = h.store.get::<CachedPost>("p1").await.unwrap().unwrap();
        assert_eq!(cached.payload.likes_count, 4);
        assert!(!cached.payload.is_liked);
        assert_eq!(cached.updated_at, 200);
    }

    #[tokio::test]
    async fn test_own_echo_is_suppressed_while_in_flight() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(post(4, true), 100)).await.unwrap();
        let event = json!({ "postId": "p1", "userId": "me", "isLiked": true, "likeCount": 4, "timestamp": 200 });

        {
            let _guard = h.registry.enter(QueryKey::post("p1"));
            let outcome = h.reconciler.on_event("post:liked", &event).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::SuppressedEcho);
        }
        assert_eq!(h.store.get::<CachedPost>("p1").await.unwrap().unwrap().updated_at, 100);

        let outcome = h.reconciler.on_event("post:liked", &event).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert!(h.store.get::<CachedPost>("p1").await.unwrap().unwrap().payload.is_liked);
    }

    #[tokio::test]
    async fn test_older_event_is_stale() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(post(9, false), 500)).await.unwrap();
        let outcome = h
            .reconciler
            .on_event(
                "post:liked",
                &json!({ "postId": "p1", "userId": "bob", "likeCount": 1, "timestamp": "1970-01-01T00:00:00.100Z" }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Stale);
        assert_eq!(h.store.get::<CachedPost>("p1").await.unwrap().unwrap().payload.likes_count, 9);
    }

    #[tokio::test]
    async fn test_follow_update_patches_target_user() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(user(10), 100)).await.unwrap();

        let from_other = json!({
            "followerId": "bob", "followingId": "42", "isFollowing": true,
            "followerCount": 11, "type": "new_follower", "timestamp": 200
        });
        h.reconciler.on_event("user:follow:update", &from_other).await.unwrap();
        let cached = h.store.get::<CachedUser>("42").await.unwrap().unwrap();
        assert_eq!(cached.payload.follower_count, 11);
        assert!(!cached.payload.is_following);

        let from_me = json!({
            "followerId": "me", "targetUserId": "42", "isFollowing": true,
            "followerCount": 12, "type": "following", "timestamp": 300
        });
        h.reconciler.on_event("user:follow:update", &from_me).await.unwrap();
        let cached = h.store.get::<CachedUser>("42").await.unwrap().unwrap();
        assert_eq!(cached.payload.follower_count, 12);
        assert!(cached.payload.is_following);
    }

    #[tokio::test]
    async fn test_message_created_then_deleted() {
        let h = harness().await;
        let created = json!({
            "conversationId": "c1",
            "message": {
                "_id": "m1", "sender": { "_id": "bob", "username": "bob" },
                "content": "hi", "createdAt": "2024-03-01T12:00:00Z"
            }
        });
        assert_eq!(
            h.reconciler.on_event("message:new", &created).await.unwrap(),
            ReconcileOutcome::Applied
        );
        let message = h.store.get::<CachedMessage>("m1").await.unwrap().unwrap();
        assert_eq!(message.payload.conversation_id, "c1");
        assert_eq!(message.payload.sender_id, "bob");

        let deleted = json!({ "conversationId": "c1", "messageId": "m1" });
        assert_eq!(
            h.reconciler.on_event("message:deleted", &deleted).await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert!(h.store.get::<CachedMessage>("m1").await.unwrap().is_none());
        assert_eq!(
            h.reconciler.on_event("message:deleted", &deleted).await.unwrap(),
            ReconcileOutcome::NotCached
        );
    }

    #[tokio::test]
    async fn test_post_edited_partial_fields() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(post(1, false), 100)).await.unwrap();
        let outcome = h
            .reconciler
            .on_event(
                "post:edited",
                &json!({ "postId": "p1", "userId": "ann", "content": "edited", "timestamp": 300 }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
        let cached = h.store.get::<CachedPost>("p1").await.unwrap().unwrap();
        assert_eq!(cached.payload.content, "edited");
        assert_eq!(cached.payload.edited_at, Some(300));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_are_ignored() {
        let h = harness().await;
        assert_eq!(
            h.reconciler.on_event("post:shared", &json!({ "postId": "p1" })).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert_eq!(
            h.reconciler.on_event("post:liked", &json!({ "likeCount": 3 })).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert_eq!(
            h.reconciler.on_event("post:liked", &json!({ "postId": "nope", "likeCount": 3 })).await.unwrap(),
            ReconcileOutcome::NotCached
        );
    }

    #[tokio::test]
    async fn test_presence_is_monotonic() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(user(0), 100)).await.unwrap();

        let online = json!({ "userId": "42", "status": "online", "timestamp": 300 });
        let late_offline = json!({ "userId": "42", "status": "offline", "timestamp": 200 });
        assert_eq!(
            h.reconciler.on_event("chat:user:status", &online).await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert_eq!(
            h.reconciler.on_event("chat:user:status", &late_offline).await.unwrap(),
            ReconcileOutcome::Stale
        );
        assert!(h.reconciler.presence().is_online("42"));
        assert!(h.store.get::<CachedUser>("42").await.unwrap().unwrap().payload.is_online);
    }

    #[tokio::test]
    async fn test_bus_subscription_applies_pushes() {
        let h = harness().await;
        h.store.put(&CachedEntity::new(post(1, false), 100)).await.unwrap();
        let handle = h.reconciler.start().unwrap();
        assert!(h.reconciler.start().is_err());

        h.events.emit(SyncEvent::RealtimeReceived {
            event_type: "post:liked".to_string(),
            payload: json!({ "postId": "p1", "userId": "bob", "likeCount": 7, "timestamp": 200 }),
        });

        let mut likes = 0;
        for _ in 0..50 {
            likes = h.store.get::<CachedPost>("p1").await.unwrap().unwrap().payload.likes_count;
            if likes == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(likes, 7);

        h.reconciler.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
