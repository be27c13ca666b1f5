//! 乐观更新协调器
//!
//! 一次乐观更新：
//! 1. 获取该缓存条目的锁（同一条目串行，不同条目并发）
//! 2. 记录快照，立即写入乐观值
//! 3. 执行网络调用
//! 4. 成功时写入服务端值（或保留乐观值等待队列同步），失败时精确恢复快照
//!
//! `InFlightRegistry` 与调度器共享，实时推送据此判断回声。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HooksDreamSDKError, Result};
use crate::events::{EventManager, MutationOutcome, SyncEvent};
use crate::storage::queue::ActionId;
use crate::storage::{CachedEntity, Entity, LocalEntityStore, QueryKey};
use crate::utils::stamp_after;

/// 正在进行网络操作的缓存条目
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    keys: Mutex<HashMap<QueryKey, usize>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 标记为进行中，guard 释放时撤销
    pub fn enter(self: &Arc<Self>, key: QueryKey) -> InFlightGuard {
        *self.keys.lock().entry(key.clone()).or_insert(0) += 1;
        InFlightGuard {
            registry: self.clone(),
            key,
        }
    }

    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.keys.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    key: QueryKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.registry.keys.lock();
        if let Some(count) = keys.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                keys.remove(&self.key);
            }
        }
    }
}

/// 网络调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkOutcome<T> {
    /// 服务端返回的权威值
    Authoritative(T),
    /// 服务端值已由其他组件写入缓存
    Applied,
    /// 已进入待同步队列，保留乐观值
    Deferred(ActionId),
}

/// 乐观更新协调器
pub struct OptimisticCoordinator {
    store: Arc<LocalEntityStore>,
    events: Arc<EventManager>,
    registry: Arc<InFlightRegistry>,
    locks: Mutex<HashMap<QueryKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl OptimisticCoordinator {
    pub fn new(store: Arc<LocalEntityStore>, events: Arc<EventManager>, registry: Arc<InFlightRegistry>) -> Self {
        Self {
            store,
            events,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// 执行一次乐观更新
    ///
    /// `updater` 收到当前值，返回乐观值（None 表示删除）；
    /// `network_call` 收到乐观值。失败时缓存恢复为调用前的快照并返回错误。
    pub async fn mutate<T, U, N, Fut>(
        &self,
        key: QueryKey,
        updater: U,
        network_call: N,
    ) -> Result<Option<CachedEntity<T>>>
    where
        T: Entity,
        U: FnOnce(Option<&T>) -> Option<T>,
        N: FnOnce(Option<T>) -> Fut,
        Fut: Future<Output = Result<NetworkOutcome<T>>>,
    {
        if key.table != T::TABLE {
            return Err(HooksDreamSDKError::InvalidArgument(format!(
                "{} 不属于表 {}",
                key,
                T::TABLE
            )));
        }

        let lock = self.key_lock(&key);
        let result = {
            let _serial = lock.lock().await;
            let _in_flight = self.registry.enter(key.clone());
            self.mutate_locked(&key, updater, network_call).await
        };
        drop(lock);
        self.prune_lock(&key);
        result
    }

    async fn mutate_locked<T, U, N, Fut>(
        &self,
        key: &QueryKey,
        updater: U,
        network_call: N,
    ) -> Result<Option<CachedEntity<T>>>
    where
        T: Entity,
        U: FnOnce(Option<&T>) -> Option<T>,
        N: FnOnce(Option<T>) -> Fut,
        Fut: Future<Output = Result<NetworkOutcome<T>>>,
    {
        let table = key.table;
        let snapshot = self.store.get_raw(table, &key.key).await?;
        let current = snapshot.clone().map(CachedEntity::<T>::from_raw).transpose()?;

        let optimistic = updater(current.as_ref().map(|c| &c.payload));
        if let Some(value) = &optimistic {
            if value.key() != key.key {
                return Err(HooksDreamSDKError::InvalidArgument(format!(
                    "乐观值的键 {} 与 {} 不一致",
                    value.key(),
                    key
                )));
            }
        }

        let optimistic_entity = optimistic
            .clone()
            .map(|value| CachedEntity::new(value, stamp_after(snapshot.as_ref().map(|s| s.updated_at))));
        match &optimistic_entity {
            Some(entity) => {
                self.store.put(entity).await?;
            }
            None if snapshot.is_some() => {
                self.store.delete(table, &key.key).await?;
            }
            None => {}
        }
        debug!("乐观写入 {}", key);

        match network_call(optimistic).await {
            Ok(NetworkOutcome::Authoritative(server)) => {
                let cached = self.store.get_raw(table, &key.key).await?.map(|e| e.updated_at);
                let entity = CachedEntity::new(server, stamp_after(cached));
                self.store.put(&entity).await?;
                self.settle(key, MutationOutcome::Confirmed);
                Ok(Some(entity))
            }
            Ok(NetworkOutcome::Applied) => {
                self.settle(key, MutationOutcome::Confirmed);
                self.store.get::<T>(&key.key).await
            }
            Ok(NetworkOutcome::Deferred(action_id)) => {
                self.settle(key, MutationOutcome::Queued { action_id });
                Ok(optimistic_entity)
            }
            Err(error) => {
                warn!("⚠️ {} 乐观更新回滚: {}", key, error);
                self.store.restore(table, &key.key, snapshot.as_ref()).await?;
                self.settle(
                    key,
                    MutationOutcome::RolledBack {
                        error: error.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    fn settle(&self, key: &QueryKey, outcome: MutationOutcome) {
        self.events.emit(SyncEvent::MutationSettled {
            query_key: key.clone(),
            outcome,
        });
    }

    fn key_lock(&self, key: &QueryKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    fn prune_lock(&self, key: &QueryKey) {
        let mut locks = self.locks.lock();
        if locks.get(key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CachedUser;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn user(followers: i64, following: bool) -> CachedUser {
        CachedUser {
            hash_id: "42".to_string(),
            username: "neo".to_string(),
            full_name: None,
            avatar: None,
            bio: None,
            is_following: following,
            follower_count: followers,
            following_count: 0,
            is_online: false,
            last_seen: None,
        }
    }

    fn toggled(current: Option<&CachedUser>) -> Option<CachedUser> {
        current.map(|u| {
            let mut next = u.clone();
            next.is_following = !u.is_following;
            next.follower_count += if next.is_following { 1 } else { -1 };
            next
        })
    }

    async fn setup() -> (Arc<LocalEntityStore>, Arc<OptimisticCoordinator>) {
        let events = Arc::new(EventManager::new(64));
        let store = Arc::new(LocalEntityStore::in_memory(events.clone()).await.unwrap());
        store.put(&CachedEntity::new(user(10, false), 100)).await.unwrap();
        let coordinator = Arc::new(OptimisticCoordinator::new(store.clone(), events, InFlightRegistry::new()));
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_failure_restores_exact_snapshot() {
        let (store, coordinator) = setup().await;
        let before = store.get_raw(crate::storage::EntityTable::Users, "42").await.unwrap();

        let err = coordinator
            .mutate::<CachedUser, _, _, _>(QueryKey::user("42"), toggled, |optimistic| async move {
                assert_eq!(optimistic.unwrap().follower_count, 11);
                Err(HooksDreamSDKError::PermanentRequest {
                    status: 403,
                    message: "blocked".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent_request");

        let after = store.get_raw(crate::storage::EntityTable::Users, "42").await.unwrap();
        assert_eq!(before, after);
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_authoritative_value_wins() {
        let (store, coordinator) = setup().await;
        let result = coordinator
            .mutate::<CachedUser, _, _, _>(QueryKey::user("42"), toggled, |_| async {
                Ok(NetworkOutcome::Authoritative(user(15, true)))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.payload.follower_count, 15);
        assert_eq!(store.get::<CachedUser>("42").await.unwrap().unwrap().payload.follower_count, 15);
    }

    #[tokio::test]
    async fn test_deferred_keeps_optimistic_value() {
        let (store, coordinator) = setup().await;
        let result = coordinator
            .mutate::<CachedUser, _, _, _>(QueryKey::user("42"), toggled, |_| async {
                Ok(NetworkOutcome::Deferred("follow-user-1".to_string()))
            })
            .await
            .unwrap()
            .unwrap();
        assert!(result.payload.is_following);
        assert_eq!(store.get::<CachedUser>("42").await.unwrap().unwrap(), result);
    }

    #[tokio::test]
    async fn test_wrong_table_is_rejected() {
        let (_, coordinator) = setup().await;
        let err = coordinator
            .mutate::<CachedUser, _, _, _>(QueryKey::post("42"), toggled, |_| async { Ok(NetworkOutcome::Applied) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_same_key_mutations_are_serialized() {
        let (store, coordinator) = setup().await;
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trace = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));

        let first = {
            let coordinator = coordinator.clone();
            let trace = trace.clone();
            tokio::spawn(async move {
                coordinator
                    .mutate::<CachedUser, _, _, _>(QueryKey::user("42"), toggled, |_| async move {
                        let _ = release_rx.await;
                        trace.lock().push("first:network");
                        Ok(NetworkOutcome::Deferred("a1".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.registry().is_in_flight(&QueryKey::user("42")));

        let second = {
            let coordinator = coordinator.clone();
            let trace = trace.clone();
            let seen = trace.clone();
            tokio::spawn(async move {
                coordinator
                    .mutate::<CachedUser, _, _, _>(
                        QueryKey::user("42"),
                        move |current| {
                            seen.lock().push("second:update");
                            toggled(current)
                        },
                        |optimistic| async move {
                            trace.lock().push("second:network");
                            // 第二次看到的是第一次的结果
                            assert!(!optimistic.unwrap().is_following);
                            Ok(NetworkOutcome::Deferred("a2".to_string()))
                        },
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // 第二次还没读快照，缓存里仍是第一次的乐观值
        assert!(trace.lock().is_empty());
        let pending = store.get::<CachedUser>("42").await.unwrap().unwrap();
        assert!(pending.payload.is_following);
        assert_eq!(pending.payload.follower_count, 11);

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(*trace.lock(), vec!["first:network", "second:update", "second:network"]);
        let cached = store.get::<CachedUser>("42").await.unwrap().unwrap();
        assert!(!cached.payload.is_following);
        assert_eq!(cached.payload.follower_count, 10);
        assert!(coordinator.locks.lock().is_empty());
    }
}
