//! 存储后端抽象
//!
//! 实体缓存和待同步队列共用一个后端：SQLite（持久）或内存（降级 / 测试）。

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::entities::{EntityTable, RawEntity};
use crate::storage::memory::MemoryBackend;
use crate::storage::sqlite::SqliteBackend;
use crate::utils::Timestamp;

/// 条件写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// 已写入
    Applied,
    /// 缓存中的值更新，本次写入被丢弃
    Stale,
    /// 缓存中没有该条目
    Missing,
}

/// pending_actions 表的一行（payload / target 为 JSON 文本）
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAction {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub target: String,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub last_attempt: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// 存储后端 trait
///
/// 每个方法是一次独立事务，调用方看不到部分写入。
#[async_trait]
pub trait EntityBackend: Send + Sync {
    /// 是否落盘
    fn is_durable(&self) -> bool;

    /// 单调写入：已有条目更新时返回 false 且不做修改
    async fn put(&self, table: EntityTable, entity: &RawEntity) -> Result<bool>;

    async fn get(&self, table: EntityTable, key: &str) -> Result<Option<RawEntity>>;

    async fn get_all(&self, table: EntityTable) -> Result<Vec<RawEntity>>;

    async fn get_by_index(&self, table: EntityTable, index: &str, value: &str) -> Result<Vec<RawEntity>>;

    async fn delete(&self, table: EntityTable, key: &str) -> Result<bool>;

    /// 仅当缓存中的条目不晚于 `as_of` 时删除
    async fn delete_as_of(&self, table: EntityTable, key: &str, as_of: Timestamp) -> Result<PatchOutcome>;

    async fn delete_many(&self, table: EntityTable, keys: &[String]) -> Result<usize>;

    /// 无条件写回快照；快照为空时删除
    async fn restore(&self, table: EntityTable, key: &str, snapshot: Option<&RawEntity>) -> Result<()>;

    async fn insert_action(&self, action: &StoredAction) -> Result<()>;

    /// 按入队顺序列出
    async fn list_actions(&self) -> Result<Vec<StoredAction>>;

    async fn get_action(&self, id: &str) -> Result<Option<StoredAction>>;

    /// retry_count + 1，记录尝试时间和错误；返回新的 retry_count
    async fn mark_action_failed(&self, id: &str, attempted_at: Timestamp, error: &str) -> Result<Option<u32>>;

    async fn remove_action(&self, id: &str) -> Result<bool>;

    async fn clear_actions(&self) -> Result<usize>;
}

/// 存储后端
pub enum StoreBackend {
    Sqlite(SqliteBackend),
    Memory(MemoryBackend),
}

impl StoreBackend {
    pub fn memory() -> Self {
        StoreBackend::Memory(MemoryBackend::new())
    }

    fn inner(&self) -> &dyn EntityBackend {
        match self {
            StoreBackend::Sqlite(b) => b as &dyn EntityBackend,
            StoreBackend::Memory(b) => b as &dyn EntityBackend,
        }
    }
}

#[async_trait]
impl EntityBackend for StoreBackend {
    fn is_durable(&self) -> bool {
        self.inner().is_durable()
    }

    async fn put(&self, table: EntityTable, entity: &RawEntity) -> Result<bool> {
        self.inner().put(table, entity).await
    }

    async fn get(&self, table: EntityTable, key: &str) -> Result<Option<RawEntity>> {
        self.inner().get(table, key).await
    }

    async fn get_all(&self, table: EntityTable) -> Result<Vec<RawEntity>> {
        self.inner().get_all(table).await
    }

    async fn get_by_index(&self, table: EntityTable, index: &str, value: &str) -> Result<Vec<RawEntity>> {
        self.inner().get_by_index(table, index, value).await
    }

    async fn delete(&self, table: EntityTable, key: &str) -> Result<bool> {
        self.inner().delete(table, key).await
    }

    async fn delete_as_of(&self, table: EntityTable, key: &str, as_of: Timestamp) -> Result<PatchOutcome> {
        self.inner().delete_as_of(table, key, as_of).await
    }

    async fn delete_many(&self, table: EntityTable, keys: &[String]) -> Result<usize> {
        self.inner().delete_many(table, keys).await
    }

    async fn restore(&self, table: EntityTable, key: &str, snapshot: Option<&RawEntity>) -> Result<()> {
        self.inner().restore(table, key, snapshot).await
    }

    async fn insert_action(&self, action: &StoredAction) -> Result<()> {
        self.inner().insert_action(action).await
    }

    async fn list_actions(&self) -> Result<Vec<StoredAction>> {
        self.inner().list_actions().await
    }

    async fn get_action(&self, id: &str) -> Result<Option<StoredAction>> {
        self.inner().get_action(id).await
    }

    async fn mark_action_failed(&self, id: &str, attempted_at: Timestamp, error: &str) -> Result<Option<u32>> {
        self.inner().mark_action_failed(id, attempted_at, error).await
    }

    async fn remove_action(&self, id: &str) -> Result<bool> {
        self.inner().remove_action(id).await
    }

    async fn clear_actions(&self) -> Result<usize> {
        self.inner().clear_actions().await
    }
}
