//! 设置存储 - 基于 sled 的键值存储
//!
//! 对应客户端的 settings 表：`{ key, value, lastUpdated }`。

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};
use tracing::warn;

use crate::error::{HooksDreamSDKError, Result};
use crate::utils::{now_millis, Timestamp};

const SETTINGS_TREE: &str = "settings";

/// 单条设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    pub value: Value,
    pub last_updated: Timestamp,
}

/// 设置存储
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db: Db,
    tree: Tree,
    persistent: bool,
}

impl SettingsStore {
    /// 打开 `{base_path}/settings`（旧实例可能刚释放锁，重试多次带退避）
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("settings");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| HooksDreamSDKError::StorageUnavailable(format!("创建设置目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => return Self::from_db(db, true),
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    last_err = Some(e);
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS << attempt)).await;
                }
            }
        }
        Err(HooksDreamSDKError::StorageUnavailable(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时实例（进程内，不落盘）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    /// 优先打开持久实例，失败时退回临时实例
    pub async fn open_or_temporary(base_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = base_path {
            match Self::open(path).await {
                Ok(store) => return Ok(store),
                Err(e) => warn!("⚠️ 设置存储不可用，使用临时存储: {}", e),
            }
        }
        Self::temporary()
    }

    fn from_db(db: Db, persistent: bool) -> Result<Self> {
        let tree = db.open_tree(SETTINGS_TREE)?;
        Ok(Self { db, tree, persistent })
    }

    /// 是否落盘
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let record = SettingRecord {
            value: serde_json::to_value(value)?,
            last_updated: now_millis(),
        };
        self.tree.insert(key.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.record(key)? {
            Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
            None => Ok(None),
        }
    }

    pub fn record(&self, key: &str) -> Result<Option<SettingRecord>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.tree.remove(key.as_bytes())?.is_some())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.tree
            .iter()
            .keys()
            .map(|k| {
                let k = k?;
                Ok(String::from_utf8_lossy(&k).into_owned())
            })
            .collect()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_settings_roundtrip_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let store = SettingsStore::open(dir.path()).await.unwrap();
            store.set("theme", &"dark").unwrap();
            store.set("badge", &true).unwrap();
            store.flush().await.unwrap();
        }

        let store = SettingsStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get::<String>("theme").unwrap().as_deref(), Some("dark"));
        assert!(store.record("badge").unwrap().unwrap().last_updated > 0);
        assert_eq!(store.keys().unwrap(), vec!["badge".to_string(), "theme".to_string()]);

        assert!(store.remove("theme").unwrap());
        assert_eq!(store.get::<String>("theme").unwrap(), None);
    }

    #[tokio::test]
    async fn test_temporary_fallback() {
        let store = SettingsStore::open_or_temporary(None).await.unwrap();
        assert!(!store.is_persistent());
        store.set("lang", &"en").unwrap();
        assert_eq!(store.get::<String>("lang").unwrap().as_deref(), Some("en"));
    }
}
