//! 在线状态
//!
//! 缓存 `chat:user:status` 推送的在线状态。每个用户按时间戳单调更新，
//! 迟到的旧推送不会覆盖新状态。

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::Timestamp;

/// 单个用户的在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub is_online: bool,
    /// 状态变化时间
    pub changed_at: Timestamp,
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct PresenceCacheConfig {
    /// 最大缓存条目数
    pub max_cache_size: usize,
}

impl Default for PresenceCacheConfig {
    fn default() -> Self {
        Self { max_cache_size: 10_000 }
    }
}

/// 在线状态缓存
pub struct PresenceTracker {
    statuses: RwLock<HashMap<String, PresenceInfo>>,
    config: PresenceCacheConfig,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_config(PresenceCacheConfig::default())
    }

    pub fn with_config(config: PresenceCacheConfig) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 更新状态；时间戳早于已知状态时忽略并返回 false
    pub fn update(&self, user_id: &str, is_online: bool, changed_at: Timestamp) -> bool {
        let mut statuses = self.statuses.write();
        if let Some(current) = statuses.get(user_id) {
            if changed_at < current.changed_at {
                debug!("忽略过期的在线状态: {} ({} < {})", user_id, changed_at, current.changed_at);
                return false;
            }
        } else if statuses.len() >= self.config.max_cache_size {
            // 淘汰最早变化的条目
            let oldest = statuses
                .iter()
                .min_by_key(|(_, info)| info.changed_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                warn!("⚠️ 在线状态缓存已满 ({})，移除 {}", self.config.max_cache_size, oldest);
                statuses.remove(&oldest);
            }
        }

        statuses.insert(user_id.to_string(), PresenceInfo { is_online, changed_at });
        true
    }

    pub fn get(&self, user_id: &str) -> Option<PresenceInfo> {
        self.statuses.read().get(user_id).copied()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.get(user_id).map(|p| p.is_online).unwrap_or(false)
    }

    /// 当前在线的用户
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .statuses
            .read()
            .iter()
            .filter(|(_, info)| info.is_online)
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.statuses.write().clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
