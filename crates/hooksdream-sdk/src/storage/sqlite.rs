//! SQLite 后端 - 持久化实体缓存与待同步队列
//!
//! 单连接 + 互斥锁，每个方法在一个事务内完成。rusqlite 是阻塞调用，
//! 所有访问都放到 `spawn_blocking` 线程上，不占用 async 工作线程。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{HooksDreamSDKError, Result};
use crate::storage::backend::{EntityBackend, PatchOutcome, StoredAction};
use crate::storage::dao::{EntityDao, PendingActionDao, TransactionManager};
use crate::storage::entities::{EntityTable, RawEntity};
use crate::storage::migrate;
use crate::utils::Timestamp;

/// 数据库文件名
pub const DB_FILE_NAME: &str = "hooksdream.db";

/// SQLite 后端
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// 打开（或创建）`{data_dir}/hooksdream.db` 并执行迁移
    ///
    /// 阻塞调用，async 上下文里用 [`SqliteBackend::open_async`]。
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            HooksDreamSDKError::StorageUnavailable(format!("创建数据目录失败 {}: {}", data_dir.display(), e))
        })?;

        let path = data_dir.join(DB_FILE_NAME);
        let mut conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate::init_db(&mut conn)?;

        info!("✅ SQLite 存储已打开: {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_async(data_dir: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::open(&data_dir))
            .await
            .map_err(join_error)?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在阻塞线程上读取
    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(join_error)?
    }

    /// 在阻塞线程上执行一个事务
    async fn with_tx<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    {
        self.blocking(move |conn| TransactionManager::new(conn).execute(f)).await
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        Ok(self.conn.lock().execute(sql, [])?)
    }
}

fn join_error(e: tokio::task::JoinError) -> HooksDreamSDKError {
    HooksDreamSDKError::Other(format!("SQLite 任务异常退出: {}", e))
}

#[async_trait]
impl EntityBackend for SqliteBackend {
    fn is_durable(&self) -> bool {
        true
    }

    async fn put(&self, table: EntityTable, entity: &RawEntity) -> Result<bool> {
        let entity = entity.clone();
        self.with_tx(move |conn| EntityDao::new(conn, table).upsert_if_newer(&entity))
            .await
    }

    async fn get(&self, table: EntityTable, key: &str) -> Result<Option<RawEntity>> {
        let key = key.to_string();
        self.blocking(move |conn| EntityDao::new(conn, table).get(&key)).await
    }

    async fn get_all(&self, table: EntityTable) -> Result<Vec<RawEntity>> {
        self.blocking(move |conn| EntityDao::new(conn, table).list_all()).await
    }

    async fn get_by_index(&self, table: EntityTable, index: &str, value: &str) -> Result<Vec<RawEntity>> {
        let (index, value) = (index.to_string(), value.to_string());
        self.blocking(move |conn| EntityDao::new(conn, table).list_by_index(&index, &value))
            .await
    }

    async fn delete(&self, table: EntityTable, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_tx(move |conn| EntityDao::new(conn, table).delete(&key)).await
    }

    async fn delete_as_of(&self, table: EntityTable, key: &str, as_of: Timestamp) -> Result<PatchOutcome> {
        let key = key.to_string();
        self.with_tx(move |conn| EntityDao::new(conn, table).delete_as_of(&key, as_of))
            .await
    }

    async fn delete_many(&self, table: EntityTable, keys: &[String]) -> Result<usize> {
        let keys = keys.to_vec();
        self.with_tx(move |conn| {
            let dao = EntityDao::new(conn, table);
            let mut removed = 0;
            for key in &keys {
                if dao.delete(key)? {
                    removed += 1;
                }
            }
            debug!("{} 批量删除 {} 条", table, removed);
            Ok(removed)
        })
        .await
    }

    async fn restore(&self, table: EntityTable, key: &str, snapshot: Option<&RawEntity>) -> Result<()> {
        let key = key.to_string();
        let snapshot = snapshot.cloned();
        self.with_tx(move |conn| {
            let dao = EntityDao::new(conn, table);
            match &snapshot {
                Some(entity) => dao.replace(entity),
                None => dao.delete(&key).map(|_| ()),
            }
        })
        .await
    }

    async fn insert_action(&self, action: &StoredAction) -> Result<()> {
        let action = action.clone();
        self.with_tx(move |conn| PendingActionDao::new(conn).insert(&action)).await
    }

    async fn list_actions(&self) -> Result<Vec<StoredAction>> {
        self.blocking(|conn| PendingActionDao::new(conn).list()).await
    }

    async fn get_action(&self, id: &str) -> Result<Option<StoredAction>> {
        let id = id.to_string();
        self.blocking(move |conn| PendingActionDao::new(conn).get(&id)).await
    }

    async fn mark_action_failed(&self, id: &str, attempted_at: Timestamp, error: &str) -> Result<Option<u32>> {
        let (id, error) = (id.to_string(), error.to_string());
        self.with_tx(move |conn| PendingActionDao::new(conn).mark_failed(&id, attempted_at, &error))
            .await
    }

    async fn remove_action(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_tx(move |conn| PendingActionDao::new(conn).remove(&id)).await
    }

    async fn clear_actions(&self) -> Result<usize> {
        self.with_tx(|conn| PendingActionDao::new(conn).clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn raw(key: &str, name: &str, ts: i64) -> RawEntity {
        RawEntity {
            key: key.to_string(),
            payload: json!({ "hashId": key, "username": name }),
            updated_at: ts,
            index_fields: BTreeMap::from([("by-username".to_string(), name.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();

        assert!(backend.put(EntityTable::Users, &raw("u1", "ann", 10)).await.unwrap());
        assert!(!backend.put(EntityTable::Users, &raw("u1", "old", 5)).await.unwrap());
        assert!(backend.put(EntityTable::Users, &raw("u1", "same", 10)).await.unwrap());

        let stored = backend.get(EntityTable::Users, "u1").await.unwrap().unwrap();
        assert_eq!(stored.payload["username"], "same");
        assert_eq!(stored.index_fields["by-username"], "same");
    }

    #[tokio::test]
    async fn test_index_follows_latest_write() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();

        backend.put(EntityTable::Users, &raw("u1", "ann", 1)).await.unwrap();
        backend.put(EntityTable::Users, &raw("u1", "bob", 2)).await.unwrap();

        assert!(backend.get_by_index(EntityTable::Users, "by-username", "ann").await.unwrap().is_empty());
        assert_eq!(backend.get_by_index(EntityTable::Users, "by-username", "bob").await.unwrap().len(), 1);

        backend.delete(EntityTable::Users, "u1").await.unwrap();
        assert!(backend.get_by_index(EntityTable::Users, "by-username", "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_as_of() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();
        backend.put(EntityTable::Users, &raw("u1", "ann", 100)).await.unwrap();

        assert_eq!(backend.delete_as_of(EntityTable::Users, "u1", 50).await.unwrap(), PatchOutcome::Stale);
        assert_eq!(backend.delete_as_of(EntityTable::Users, "u1", 100).await.unwrap(), PatchOutcome::Applied);
        assert_eq!(backend.delete_as_of(EntityTable::Users, "u1", 200).await.unwrap(), PatchOutcome::Missing);
    }

    #[tokio::test]
    async fn test_actions_keep_insertion_order() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            backend
                .insert_action(&StoredAction {
                    id: id.to_string(),
                    kind: "like-post".to_string(),
                    payload: "{}".to_string(),
                    target: "{}".to_string(),
                    retry_count: 0,
                    created_at: 1_000 - i as i64,
                    last_attempt: None,
                    last_error: None,
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = backend.list_actions().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        assert_eq!(backend.mark_action_failed("a", 5, "boom").await.unwrap(), Some(1));
        assert_eq!(backend.mark_action_failed("a", 6, "boom").await.unwrap(), Some(2));
        assert_eq!(backend.mark_action_failed("zzz", 6, "boom").await.unwrap(), None);
        let a = backend.get_action("a").await.unwrap().unwrap();
        assert_eq!(a.last_attempt, Some(6));
        assert_eq!(a.last_error.as_deref(), Some("boom"));
    }
}
