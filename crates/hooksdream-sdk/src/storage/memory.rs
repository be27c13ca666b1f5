//! 内存后端：持久存储不可用时的降级方案，进程退出即丢失

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{HooksDreamSDKError, Result};
use crate::storage::backend::{EntityBackend, PatchOutcome, StoredAction};
use crate::storage::entities::{EntityTable, RawEntity};
use crate::utils::Timestamp;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<EntityTable, BTreeMap<String, RawEntity>>,
    /// 按入队顺序
    actions: Vec<StoredAction>,
}

/// 内存后端
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityBackend for MemoryBackend {
    fn is_durable(&self) -> bool {
        false
    }

    async fn put(&self, table: EntityTable, entity: &RawEntity) -> Result<bool> {
        let mut state = self.state.lock();
        let rows = state.tables.entry(table).or_default();
        if let Some(existing) = rows.get(&entity.key) {
            if existing.updated_at > entity.updated_at {
                return Ok(false);
            }
        }
        rows.insert(entity.key.clone(), entity.clone());
        Ok(true)
    }

    async fn get(&self, table: EntityTable, key: &str) -> Result<Option<RawEntity>> {
        let state = self.state.lock();
        Ok(state.tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn get_all(&self, table: EntityTable) -> Result<Vec<RawEntity>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_index(&self, table: EntityTable, index: &str, value: &str) -> Result<Vec<RawEntity>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|e| e.index_fields.get(index).map(String::as_str) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, table: EntityTable, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state
            .tables
            .get_mut(&table)
            .map(|rows| rows.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn delete_as_of(&self, table: EntityTable, key: &str, as_of: Timestamp) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        let Some(rows) = state.tables.get_mut(&table) else {
            return Ok(PatchOutcome::Missing);
        };
        match rows.get(key) {
            None => Ok(PatchOutcome::Missing),
            Some(existing) if existing.updated_at > as_of => Ok(PatchOutcome::Stale),
            Some(_) => {
                rows.remove(key);
                Ok(PatchOutcome::Applied)
            }
        }
    }

    async fn delete_many(&self, table: EntityTable, keys: &[String]) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(rows) = state.tables.get_mut(&table) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|k| rows.remove(k.as_str()).is_some()).count())
    }

    async fn restore(&self, table: EntityTable, key: &str, snapshot: Option<&RawEntity>) -> Result<()> {
        let mut state = self.state.lock();
        let rows = state.tables.entry(table).or_default();
        match snapshot {
            Some(entity) => {
                rows.insert(key.to_string(), entity.clone());
            }
            None => {
                rows.remove(key);
            }
        }
        Ok(())
    }

    async fn insert_action(&self, action: &StoredAction) -> Result<()> {
        let mut state = self.state.lock();
        if state.actions.iter().any(|a| a.id == action.id) {
            return Err(HooksDreamSDKError::InvalidArgument(format!("操作 {} 已存在", action.id)));
        }
        state.actions.push(action.clone());
        Ok(())
    }

    async fn list_actions(&self) -> Result<Vec<StoredAction>> {
        Ok(self.state.lock().actions.clone())
    }

    async fn get_action(&self, id: &str) -> Result<Option<StoredAction>> {
        Ok(self.state.lock().actions.iter().find(|a| a.id == id).cloned())
    }

    async fn mark_action_failed(&self, id: &str, attempted_at: Timestamp, error: &str) -> Result<Option<u32>> {
        let mut state = self.state.lock();
        Ok(state.actions.iter_mut().find(|a| a.id == id).map(|a| {
            a.retry_count += 1;
            a.last_attempt = Some(attempted_at);
            a.last_error = Some(error.to_string());
            a.retry_count
        }))
    }

    async fn remove_action(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let before = state.actions.len();
        state.actions.retain(|a| a.id != id);
        Ok(state.actions.len() != before)
    }

    async fn clear_actions(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let count = state.actions.len();
        state.actions.clear();
        Ok(count)
    }
}
