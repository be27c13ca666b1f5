//! 存储模块 - 离线优先的本地实体缓存
//!
//! 分层结构：
//! - `LocalEntityStore`: 统一入口，负责单调时间戳规则、索引校验、事件通知和降级
//! - `StoreBackend`: SQLite（持久）/ 内存（降级）两种后端
//! - DAO Layer: SQLite 下每张表的具体读写
//! - `queue`: 建在同一个后端上的待同步操作队列
//! - `kv`: 设置存储（sled）
//!
//! 持久存储不可用时（磁盘满、只读、无法打开），任何操作都会以
//! `StorageUnavailable` 失败；此时已提交的实体和待同步操作被复制到新的内存后端，
//! 存储切换过去、通知能力代理降级，并在内存后端上重试一次。

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::capability::{Capability, CapabilityBroker};
use crate::error::{HooksDreamSDKError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::utils::time::days_to_millis;
use crate::utils::{now_millis, Timestamp};

pub mod backend;
pub mod dao;
pub mod entities;
pub mod kv;
pub mod memory;
pub mod migrate;
pub mod queue;
pub mod sqlite;

pub use backend::{EntityBackend, PatchOutcome, StoreBackend, StoredAction};
pub use dao::TransactionManager;
pub use entities::*;
pub use kv::{SettingRecord, SettingsStore};

/// 缓存清理策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// 帖子保留天数
    pub post_retention_days: u32,
    /// 每个会话保留的最新消息数
    pub max_messages_per_conversation: usize,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            post_retention_days: 7,
            max_messages_per_conversation: 1000,
        }
    }
}

/// 清理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub posts_removed: usize,
    pub messages_removed: usize,
}

/// 本地实体存储
pub struct LocalEntityStore {
    backend: RwLock<Arc<StoreBackend>>,
    settings: SettingsStore,
    events: Arc<EventManager>,
    broker: Option<Arc<CapabilityBroker>>,
    downgrade_lock: tokio::sync::Mutex<()>,
}

impl LocalEntityStore {
    /// 打开存储；`data_dir` 为 None 或持久存储打开失败时使用内存后端
    pub async fn open(
        data_dir: Option<&Path>,
        events: Arc<EventManager>,
        broker: Option<Arc<CapabilityBroker>>,
    ) -> Result<Self> {
        let (backend, settings_dir) = match data_dir {
            Some(dir) => match sqlite::SqliteBackend::open_async(dir.to_path_buf()).await {
                Ok(backend) => (StoreBackend::Sqlite(backend), Some(dir)),
                Err(HooksDreamSDKError::StorageUnavailable(reason)) => {
                    warn!("⚠️ 无法打开持久存储，使用内存存储: {}", reason);
                    Self::notify_downgrade(&events, broker.as_deref(), &reason);
                    (StoreBackend::memory(), None)
                }
                Err(e) => return Err(e),
            },
            None => (StoreBackend::memory(), None),
        };
        let settings = SettingsStore::open_or_temporary(settings_dir).await?;

        info!(
            "✅ 本地实体存储已就绪 (durable={}, settings_persistent={})",
            backend.is_durable(),
            settings.is_persistent()
        );
        Ok(Self {
            backend: RwLock::new(Arc::new(backend)),
            settings,
            events,
            broker,
            downgrade_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// 纯内存存储
    pub async fn in_memory(events: Arc<EventManager>) -> Result<Self> {
        Self::open(None, events, None).await
    }

    pub fn is_durable(&self) -> bool {
        self.backend.read().is_durable()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub(crate) fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    fn backend(&self) -> Arc<StoreBackend> {
        self.backend.read().clone()
    }

    /// 在当前后端上执行；持久后端报 StorageUnavailable 时降级并在内存后端重试一次
    pub(crate) async fn run<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: Fn(Arc<StoreBackend>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let backend = self.backend();
        match op(backend.clone()).await {
            Err(HooksDreamSDKError::StorageUnavailable(reason)) if backend.is_durable() => {
                self.downgrade(&reason).await;
                op(self.backend()).await
            }
            other => other,
        }
    }

    async fn downgrade(&self, reason: &str) {
        let _serial = self.downgrade_lock.lock().await;
        let old = self.backend();
        if !old.is_durable() {
            return;
        }
        let memory = StoreBackend::memory();
        Self::carry_over(&old, &memory).await;
        *self.backend.write() = Arc::new(memory);
        warn!("⚠️ 持久存储不可用，降级为内存存储: {}", reason);
        Self::notify_downgrade(&self.events, self.broker.as_deref(), reason);
    }

    /// 把旧后端里还能读出的实体和操作复制到内存后端；读不出的部分只记日志
    async fn carry_over(from: &StoreBackend, to: &StoreBackend) {
        match from.list_actions().await {
            Ok(actions) => {
                for action in &actions {
                    if let Err(e) = to.insert_action(action).await {
                        warn!("⚠️ 复制待同步操作 {} 失败: {}", action.id, e);
                    }
                }
                info!("🔄 已复制 {} 个待同步操作到内存存储", actions.len());
            }
            Err(e) => error!("❌ 读取待同步操作失败，降级后队列为空: {}", e),
        }

        for table in EntityTable::ALL {
            match from.get_all(table).await {
                Ok(rows) => {
                    for row in &rows {
                        if let Err(e) = to.put(table, row).await {
                            warn!("⚠️ 复制 {}/{} 失败: {}", table, row.key, e);
                        }
                    }
                }
                Err(e) => warn!("⚠️ 读取表 {} 失败，降级后该表为空: {}", table, e),
            }
        }
    }

    fn notify_downgrade(events: &EventManager, broker: Option<&CapabilityBroker>, reason: &str) {
        match broker {
            Some(broker) => broker.downgrade_durable_storage(reason),
            None => events.emit(SyncEvent::CapabilityDowngraded {
                capability: Capability::DurableStorage,
                reason: reason.to_string(),
            }),
        }
    }

    // ========== 基础操作 ==========

    /// 写入实体；时间戳早于缓存值时不做修改并返回 false
    pub async fn put<T: Entity>(&self, entity: &CachedEntity<T>) -> Result<bool> {
        let raw = entity.to_raw()?;
        self.put_raw(T::TABLE, &raw).await
    }

    pub async fn put_raw(&self, table: EntityTable, entity: &RawEntity) -> Result<bool> {
        if let Some(index) = entity.index_fields.keys().find(|idx| !table.has_index(idx)) {
            return Err(HooksDreamSDKError::InvalidArgument(format!(
                "表 {} 未声明索引 {}",
                table, index
            )));
        }
        let applied = self.run(|b| async move { b.put(table, entity).await }).await?;
        if applied {
            self.events.emit(SyncEvent::CacheUpdated {
                table,
                key: entity.key.clone(),
                updated_at: entity.updated_at,
            });
        }
        Ok(applied)
    }

    pub async fn get<T: Entity>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
        self.get_raw(T::TABLE, key).await?.map(CachedEntity::from_raw).transpose()
    }

    pub async fn get_raw(&self, table: EntityTable, key: &str) -> Result<Option<RawEntity>> {
        self.run(|b| async move { b.get(table, key).await }).await
    }

    pub async fn get_all<T: Entity>(&self) -> Result<Vec<CachedEntity<T>>> {
        self.get_all_raw(T::TABLE)
            .await?
            .into_iter()
            .map(CachedEntity::from_raw)
            .collect()
    }

    pub async fn get_all_raw(&self, table: EntityTable) -> Result<Vec<RawEntity>> {
        self.run(|b| async move { b.get_all(table).await }).await
    }

    pub async fn get_by_index<T: Entity>(&self, index: &str, value: &str) -> Result<Vec<CachedEntity<T>>> {
        self.get_by_index_raw(T::TABLE, index, value)
            .await?
            .into_iter()
            .map(CachedEntity::from_raw)
            .collect()
    }

    pub async fn get_by_index_raw(&self, table: EntityTable, index: &str, value: &str) -> Result<Vec<RawEntity>> {
        if !table.has_index(index) {
            return Err(HooksDreamSDKError::InvalidArgument(format!("表 {} 没有索引 {}", table, index)));
        }
        self.run(|b| async move { b.get_by_index(table, index, value).await }).await
    }

    pub async fn delete(&self, table: EntityTable, key: &str) -> Result<bool> {
        let removed = self.run(|b| async move { b.delete(table, key).await }).await?;
        if removed {
            self.emit_removed(table, key);
        }
        Ok(removed)
    }

    // ========== 条件写入（实时推送 / 服务端确认） ==========

    /// 按单调规则删除：缓存条目比 `as_of` 新时保留
    pub async fn delete_as_of(&self, table: EntityTable, key: &str, as_of: Timestamp) -> Result<PatchOutcome> {
        let outcome = self.run(|b| async move { b.delete_as_of(table, key, as_of).await }).await?;
        if outcome == PatchOutcome::Applied {
            self.emit_removed(table, key);
        }
        Ok(outcome)
    }

    /// 把 JSON patch 合并到缓存条目上（null 表示删除字段），时间戳为 `updated_at`
    pub async fn merge_patch(
        &self,
        table: EntityTable,
        key: &str,
        patch: &Value,
        updated_at: Timestamp,
    ) -> Result<PatchOutcome> {
        let Some(current) = self.get_raw(table, key).await? else {
            return Ok(PatchOutcome::Missing);
        };
        if current.updated_at > updated_at {
            return Ok(PatchOutcome::Stale);
        }

        let mut payload = current.payload.clone();
        merge_json(&mut payload, patch);
        let mut updated = match RawEntity::from_value(table, payload.clone(), updated_at) {
            Ok(entity) => entity,
            Err(_) => RawEntity {
                key: key.to_string(),
                payload,
                updated_at,
                index_fields: current.index_fields,
            },
        };
        updated.key = key.to_string();

        if self.put_raw(table, &updated).await? {
            Ok(PatchOutcome::Applied)
        } else {
            Ok(PatchOutcome::Stale)
        }
    }

    /// 把条目恢复为快照（无条件），快照为空时删除
    pub async fn restore(&self, table: EntityTable, key: &str, snapshot: Option<&RawEntity>) -> Result<()> {
        self.run(|b| async move { b.restore(table, key, snapshot).await }).await?;
        match snapshot {
            Some(entity) => self.events.emit(SyncEvent::CacheUpdated {
                table,
                key: key.to_string(),
                updated_at: entity.updated_at,
            }),
            None => self.emit_removed(table, key),
        }
        Ok(())
    }

    fn emit_removed(&self, table: EntityTable, key: &str) {
        self.events.emit(SyncEvent::CacheRemoved {
            table,
            key: key.to_string(),
        });
    }

    // ========== 查询 ==========

    /// 按用户名 / 昵称模糊搜索（不区分大小写）
    pub async fn search_users(&self, query: &str, limit: usize) -> Result<Vec<CachedEntity<CachedUser>>> {
        let needle = query.to_lowercase();
        let users = self.get_all::<CachedUser>().await?;
        Ok(users
            .into_iter()
            .filter(|u| {
                u.payload.username.to_lowercase().contains(&needle)
                    || u.payload
                        .full_name
                        .as_ref()
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .take(limit)
            .collect())
    }

    /// 最新的帖子（按创建时间倒序）
    pub async fn recent_posts(&self, limit: usize) -> Result<Vec<CachedEntity<CachedPost>>> {
        let mut posts = self.get_all::<CachedPost>().await?;
        posts.sort_by(|a, b| b.payload.created_at.cmp(&a.payload.created_at));
        posts.truncate(limit);
        Ok(posts)
    }

    pub async fn posts_by_author(&self, author_id: &str) -> Result<Vec<CachedEntity<CachedPost>>> {
        let mut posts = self.get_by_index::<CachedPost>("by-author", author_id).await?;
        posts.sort_by(|a, b| b.payload.created_at.cmp(&a.payload.created_at));
        Ok(posts)
    }

    /// 会话最近 `limit` 条消息，按时间正序返回
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CachedEntity<CachedMessage>>> {
        let mut messages = self
            .get_by_index::<CachedMessage>("by-conversation", conversation_id)
            .await?;
        messages.sort_by(|a, b| {
            a.payload
                .created_at
                .cmp(&b.payload.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    /// 会话列表（按最后活跃时间倒序）
    pub async fn recent_conversations(&self) -> Result<Vec<CachedEntity<CachedConversation>>> {
        let mut conversations = self.get_all::<CachedConversation>().await?;
        conversations.sort_by(|a, b| b.payload.last_activity.cmp(&a.payload.last_activity));
        Ok(conversations)
    }

    // ========== 维护 ==========

    /// 清理过期帖子和超量消息
    pub async fn cleanup(&self, policy: &CleanupPolicy) -> Result<CleanupReport> {
        let cutoff = now_millis() - days_to_millis(policy.post_retention_days);
        let expired_posts: Vec<String> = self
            .get_all::<CachedPost>()
            .await?
            .into_iter()
            .filter(|p| p.payload.created_at < cutoff)
            .map(|p| p.key)
            .collect();

        let mut by_conversation: std::collections::HashMap<String, Vec<CachedEntity<CachedMessage>>> =
            std::collections::HashMap::new();
        for message in self.get_all::<CachedMessage>().await? {
            by_conversation
                .entry(message.payload.conversation_id.clone())
                .or_default()
                .push(message);
        }
        let mut excess_messages = Vec::new();
        for (_, mut messages) in by_conversation {
            if messages.len() <= policy.max_messages_per_conversation {
                continue;
            }
            messages.sort_by(|a, b| b.payload.created_at.cmp(&a.payload.created_at));
            excess_messages.extend(
                messages
                    .into_iter()
                    .skip(policy.max_messages_per_conversation)
                    .map(|m| m.key),
            );
        }

        let posts_removed = self.delete_keys(EntityTable::Posts, &expired_posts).await?;
        let messages_removed = self.delete_keys(EntityTable::Messages, &excess_messages).await?;
        info!("🧹 缓存清理完成: 帖子 {} 条, 消息 {} 条", posts_removed, messages_removed);
        Ok(CleanupReport {
            posts_removed,
            messages_removed,
        })
    }

    async fn delete_keys(&self, table: EntityTable, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.run(|b| async move { b.delete_many(table, keys).await }).await?;
        for key in keys {
            self.emit_removed(table, key);
        }
        Ok(removed)
    }
}

/// JSON merge patch：对象递归合并，null 删除字段，其余直接覆盖
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge_json(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn user(id: &str, name: &str, followers: i64) -> CachedUser {
        CachedUser {
            hash_id: id.to_string(),
            username: name.to_string(),
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

    fn message(id: &str, conversation: &str, created_at: i64) -> CachedMessage {
        CachedMessage {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            sender_id: "u1".to_string(),
            content: format!("msg {}", id),
            message_type: "text".to_string(),
            status: "sent".to_string(),
            created_at,
        }
    }

    fn post(id: &str, author: &str, created_at: i64) -> CachedPost {
        CachedPost {
            id: id.to_string(),
            author: PostAuthor {
                hash_id: author.to_string(),
                username: author.to_string(),
                avatar: None,
            },
            content: "hello".to_string(),
            images: vec![],
            likes_count: 0,
            is_liked: false,
            comments_count: 0,
            created_at,
            edited_at: None,
        }
    }

    async fn memory_store() -> LocalEntityStore {
        LocalEntityStore::in_memory(Arc::new(EventManager::new(64))).await.unwrap()
    }

    #[tokio::test]
    async fn test_stale_put_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = LocalEntityStore::open(Some(dir.path()), Arc::new(EventManager::new(64)), None)
            .await
            .unwrap();
        assert!(store.is_durable());

        assert!(store.put(&CachedEntity::new(user("u1", "ann", 10), 200)).await.unwrap());
        assert!(!store.put(&CachedEntity::new(user("u1", "ann", 99), 100)).await.unwrap());

        let cached = store.get::<CachedUser>("u1").await.unwrap().unwrap();
        assert_eq!(cached.payload.follower_count, 10);
        assert_eq!(cached.updated_at, 200);
    }

    #[tokio::test]
    async fn test_put_emits_cache_updated_only_when_applied() {
        let events = Arc::new(EventManager::new(64));
        let mut rx = events.subscribe();
        let store = LocalEntityStore::in_memory(events.clone()).await.unwrap();

        store.put(&CachedEntity::new(user("u1", "ann", 1), 5)).await.unwrap();
        store.put(&CachedEntity::new(user("u1", "ann", 2), 4)).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type(), "cache_updated");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_index_is_rejected() {
        let store = memory_store().await;
        let err = store.get_by_index::<CachedUser>("by-email", "x").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let mut raw = CachedEntity::new(user("u1", "ann", 1), 1).to_raw().unwrap();
        raw.index_fields.insert("by-email".to_string(), "a@b".to_string());
        assert!(store.put_raw(EntityTable::Users, &raw).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_patch_respects_timestamps() {
        let store = memory_store().await;
        store.put(&CachedEntity::new(user("42", "neo", 10), 100)).await.unwrap();

        let patch = json!({ "followerCount": 11, "isFollowing": true });
        assert_eq!(
            store.merge_patch(EntityTable::Users, "42", &patch, 50).await.unwrap(),
            PatchOutcome::Stale
        );
        assert_eq!(
            store.merge_patch(EntityTable::Users, "42", &patch, 150).await.unwrap(),
            PatchOutcome::Applied
        );
        assert_eq!(
            store.merge_patch(EntityTable::Users, "missing", &patch, 150).await.unwrap(),
            PatchOutcome::Missing
        );

        let cached = store.get::<CachedUser>("42").await.unwrap().unwrap();
        assert_eq!(cached.payload.follower_count, 11);
        assert!(cached.payload.is_following);
        assert_eq!(cached.updated_at, 150);
        assert_eq!(cached.index_fields["by-username"], "neo");
    }

    #[tokio::test]
    async fn test_restore_is_exact() {
        let store = memory_store().await;
        let original = CachedEntity::new(user("u1", "ann", 3), 10);
        store.put(&original).await.unwrap();
        let snapshot = store.get_raw(EntityTable::Users, "u1").await.unwrap();

        store.put(&CachedEntity::new(user("u1", "ann", 4), 20)).await.unwrap();
        store.restore(EntityTable::Users, "u1", snapshot.as_ref()).await.unwrap();
        assert_eq!(store.get::<CachedUser>("u1").await.unwrap(), Some(original));

        store.restore(EntityTable::Users, "u1", None).await.unwrap();
        assert_eq!(store.get::<CachedUser>("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_typed_queries() {
        let store = memory_store().await;
        store.put(&CachedEntity::new(user("u1", "Annabel", 0), 1)).await.unwrap();
        store.put(&CachedEntity::new(user("u2", "bob", 0), 1)).await.unwrap();
        for i in 0..5 {
            store
                .put(&CachedEntity::new(message(&format!("m{}", i), "c1", i), 1))
                .await
                .unwrap();
        }
        store.put(&CachedEntity::new(message("other", "c2", 3), 1)).await.unwrap();
        store.put(&CachedEntity::new(post("p1", "u1", 10), 1)).await.unwrap();
        store.put(&CachedEntity::new(post("p2", "u1", 20), 1)).await.unwrap();
        store.put(&CachedEntity::new(post("p3", "u2", 15), 1)).await.unwrap();

        let found = store.search_users("ANNA", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "u1");

        let last_three: Vec<String> = store
            .conversation_messages("c1", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(last_three, vec!["m2", "m3", "m4"]);

        let recent: Vec<String> = store.recent_posts(2).await.unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(recent, vec!["p2", "p3"]);
        assert_eq!(store.posts_by_author("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_policy() {
        let store = memory_store().await;
        let now = now_millis();
        store
            .put(&CachedEntity::new(post("old", "u1", now - days_to_millis(8)), 1))
            .await
            .unwrap();
        store.put(&CachedEntity::new(post("new", "u1", now), 1)).await.unwrap();
        for i in 0..5 {
            store
                .put(&CachedEntity::new(message(&format!("m{}", i), "c1", i), 1))
                .await
                .unwrap();
        }

        let report = store
            .cleanup(&CleanupPolicy {
                post_retention_days: 7,
                max_messages_per_conversation: 2,
            })
            .await
            .unwrap();
        assert_eq!(report, CleanupReport { posts_removed: 1, messages_removed: 3 });
        assert!(store.get::<CachedPost>("old").await.unwrap().is_none());
        let kept: Vec<String> = store
            .conversation_messages("c1", 50)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(kept, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_unavailable_storage_downgrades_to_memory() {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(EventManager::new(64));
        let mut rx = events.subscribe_filtered(
            crate::events::EventFilter::new().with_event_types(vec!["capability_downgraded".to_string()]),
        );
        let store = LocalEntityStore::open(Some(dir.path()), events, None).await.unwrap();
        assert!(store.is_durable());

        // 让数据库只读，下一次写入会失败
        if let StoreBackend::Sqlite(sqlite) = store.backend().as_ref() {
            sqlite.execute_raw("PRAGMA query_only = ON").ok();
        }
        let err_or_ok = store.put(&CachedEntity::new(user("u1", "ann", 1), 1)).await;

        assert!(err_or_ok.unwrap());
        assert!(!store.is_durable());
        assert!(store.get::<CachedUser>("u1").await.unwrap().is_some());
        assert!(rx.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_downgrade_keeps_committed_rows() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            LocalEntityStore::open(Some(dir.path()), Arc::new(EventManager::new(64)), None)
                .await
                .unwrap(),
        );
        let ledger = queue::PendingActionLedger::new(store.clone());
        let like = |post_id: &str| {
            queue::ActionPayload::LikePost(queue::LikePostPayload {
                post_id: post_id.to_string(),
                like: true,
            })
        };

        store.put(&CachedEntity::new(user("u1", "ann", 3), 1)).await.unwrap();
        let first = ledger.enqueue(like("p1"), queue::EndpointDescriptor::post("/x")).await.unwrap();

        if let StoreBackend::Sqlite(sqlite) = store.backend().as_ref() {
            sqlite.execute_raw("PRAGMA query_only = ON").ok();
        }
        let second = ledger.enqueue(like("p2"), queue::EndpointDescriptor::post("/x")).await.unwrap();

        assert!(!store.is_durable());
        let ids: Vec<queue::ActionId> = ledger.list().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        let carried = store.get::<CachedUser>("u1").await.unwrap().unwrap();
        assert_eq!(carried.payload.follower_count, 3);
        assert_eq!(carried.updated_at, 1);
    }

    #[test]
    fn test_merge_json() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 }, "e": 4 });
        merge_json(&mut target, &json!({ "a": 9, "b": { "c": null }, "e": null, "f": true }));
        assert_eq!(target, json!({ "a": 9, "b": { "d": 3 }, "f": true }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// 无论写入顺序如何，读到的都是时间戳最大的那次写入
        #[test]
        fn prop_get_returns_newest_write(writes in proptest::collection::vec((0i64..40, 0i64..1000), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (stored_ts, stored_followers) = rt.block_on(async {
                let store = memory_store().await;
                for (ts, followers) in &writes {
                    store.put(&CachedEntity::new(user("u1", "ann", *followers), *ts)).await.unwrap();
                }
                let cached = store.get::<CachedUser>("u1").await.unwrap().unwrap();
                (cached.updated_at, cached.payload.follower_count)
            });

            let max_ts = writes.iter().map(|(ts, _)| *ts).max().unwrap();
            // 相同时间戳时后写入者覆盖
            let expected = writes.iter().rev().find(|(ts, _)| *ts == max_ts).unwrap().1;
            prop_assert_eq!(stored_ts, max_ts);
            prop_assert_eq!(stored_followers, expected);
        }
    }
}
