//! 缓存实体定义
//!
//! 每种实体对应一张逻辑表，键在表内唯一，`updated_at` 单调不减。
//! payload 与服务端 JSON 保持一致（camelCase），便于直接落库与回放。

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HooksDreamSDKError, Result};
use crate::utils::{parse_timestamp, Timestamp};

/// 实体表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityTable {
    Users,
    Posts,
    Messages,
    Conversations,
}

impl EntityTable {
    pub const ALL: [EntityTable; 4] = [
        EntityTable::Users,
        EntityTable::Posts,
        EntityTable::Messages,
        EntityTable::Conversations,
    ];

    /// 表名（同时是 SQLite 表名）
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Users => "users",
            EntityTable::Posts => "posts",
            EntityTable::Messages => "messages",
            EntityTable::Conversations => "conversations",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// 建表时声明的二级索引
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            EntityTable::Users => &["by-username"],
            EntityTable::Posts => &["by-author", "by-created"],
            EntityTable::Messages => &["by-conversation", "by-created", "by-status"],
            EntityTable::Conversations => &[],
        }
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indexes().contains(&index)
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓存条目的逻辑地址（表 + 键）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub table: EntityTable,
    pub key: String,
}

impl QueryKey {
    pub fn new(table: EntityTable, key: impl Into<String>) -> Self {
        Self { table, key: key.into() }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityTable::Users, id)
    }

    pub fn post(id: impl Into<String>) -> Self {
        Self::new(EntityTable::Posts, id)
    }

    pub fn message(id: impl Into<String>) -> Self {
        Self::new(EntityTable::Messages, id)
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Self::new(EntityTable::Conversations, id)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// 带时间戳和索引字段的缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T> {
    pub key: String,
    pub payload: T,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub index_fields: BTreeMap<String, String>,
}

/// 存储层使用的无类型条目
pub type RawEntity = CachedEntity<Value>;

/// 可缓存的领域实体
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: EntityTable;

    fn key(&self) -> String;

    fn index_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl<T: Entity> CachedEntity<T> {
    pub fn new(payload: T, updated_at: Timestamp) -> Self {
        Self {
            key: payload.key(),
            index_fields: payload.index_fields(),
            payload,
            updated_at,
        }
    }

    pub fn to_raw(&self) -> Result<RawEntity> {
        Ok(CachedEntity {
            key: self.key.clone(),
            payload: serde_json::to_value(&self.payload)?,
            updated_at: self.updated_at,
            index_fields: self.index_fields.clone(),
        })
    }

    pub fn from_raw(raw: RawEntity) -> Result<Self> {
        let payload = serde_json::from_value(raw.payload).map_err(|e| {
            HooksDreamSDKError::Serialization(format!(
                "{} 缓存条目 {} 解析失败: {}",
                T::TABLE,
                raw.key,
                e
            ))
        })?;
        Ok(CachedEntity {
            key: raw.key,
            payload,
            updated_at: raw.updated_at,
            index_fields: raw.index_fields,
        })
    }
}

impl RawEntity {
    /// 从服务端 JSON 构造无类型条目，按表补齐索引字段
    pub fn from_value(table: EntityTable, payload: Value, updated_at: Timestamp) -> Result<Self> {
        let entity = match table {
            EntityTable::Users => CachedEntity::new(serde_json::from_value::<CachedUser>(payload)?, updated_at).to_raw()?,
            EntityTable::Posts => CachedEntity::new(serde_json::from_value::<CachedPost>(payload)?, updated_at).to_raw()?,
            EntityTable::Messages => {
                CachedEntity::new(serde_json::from_value::<CachedMessage>(payload)?, updated_at).to_raw()?
            }
            EntityTable::Conversations => {
                CachedEntity::new(serde_json::from_value::<CachedConversation>(payload)?, updated_at).to_raw()?
            }
        };
        Ok(entity)
    }
}

/// 服务端时间字段可能是 ISO-8601 字符串，也可能是毫秒数
fn flexible_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Timestamp, D::Error> {
    let value = Value::deserialize(deserializer)?;
    parse_timestamp(&value).ok_or_else(|| de::Error::custom(format!("无法解析的时间: {}", value)))
}

fn default_message_type() -> String {
    "text".to_string()
}

fn default_message_status() -> String {
    "sent".to_string()
}

/// 用户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUser {
    pub hash_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default)]
    pub is_following: bool,
    #[serde(default)]
    pub follower_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

impl Entity for CachedUser {
    const TABLE: EntityTable = EntityTable::Users;

    fn key(&self) -> String {
        self.hash_id.clone()
    }

    fn index_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("by-username".to_string(), self.username.to_lowercase())])
    }
}

/// 帖子作者摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostAuthor {
    pub hash_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// 帖子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPost {
    #[serde(rename = "_id")]
    pub id: String,
    pub author: PostAuthor,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub likes_count: i64,
    #[serde(default)]
    pub is_liked: bool,
    #[serde(default)]
    pub comments_count: i64,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
}

impl Entity for CachedPost {
    const TABLE: EntityTable = EntityTable::Posts;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("by-author".to_string(), self.author.hash_id.clone()),
            ("by-created".to_string(), self.created_at.to_string()),
        ])
    }
}

/// 私信消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default = "default_message_status")]
    pub status: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub created_at: Timestamp,
}

impl Entity for CachedMessage {
    const TABLE: EntityTable = EntityTable::Messages;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("by-conversation".to_string(), self.conversation_id.clone()),
            ("by-created".to_string(), self.created_at.to_string()),
            ("by-status".to_string(), self.status.clone()),
        ])
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConversation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub last_activity: Timestamp,
}

impl Entity for CachedConversation {
    const TABLE: EntityTable = EntityTable::Conversations;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_wire_format() {
        let post: CachedPost = serde_json::from_value(json!({
            "_id": "p1",
            "author": { "hashId": "u1", "username": "ann" },
            "content": "hello",
            "likesCount": 3,
            "createdAt": 1700000000000i64
        }))
        .unwrap();
        assert_eq!(post.key(), "p1");
        assert!(!post.is_liked);
        assert_eq!(post.index_fields()["by-author"], "u1");

        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(value["_id"], "p1");
        assert_eq!(value["likesCount"], 3);
    }

    #[test]
    fn test_raw_from_value_fills_indexes() {
        let raw = RawEntity::from_value(
            EntityTable::Messages,
            json!({
                "_id": "m1",
                "conversationId": "c1",
                "senderId": "u1",
                "content": "hi",
                "createdAt": 5
            }),
            10,
        )
        .unwrap();
        assert_eq!(raw.key, "m1");
        assert_eq!(raw.index_fields["by-conversation"], "c1");
        assert_eq!(raw.index_fields["by-status"], "sent");
        assert!(RawEntity::from_value(EntityTable::Messages, json!({"_id": 1}), 10).is_err());
    }

    #[test]
    fn test_iso_created_at_is_accepted() {
        let message: CachedMessage = serde_json::from_value(json!({
            "_id": "m2",
            "conversationId": "c1",
            "senderId": "u1",
            "content": "hi",
            "createdAt": "2024-03-01T12:00:00.000Z"
        }))
        .unwrap();
        assert_eq!(message.created_at, 1_709_294_400_000);
        assert_eq!(message.index_fields()["by-created"], "1709294400000");
    }

    #[test]
    fn test_table_metadata() {
        assert_eq!(EntityTable::from_name("posts"), Some(EntityTable::Posts));
        assert_eq!(EntityTable::from_name("pendingActions"), None);
        assert!(EntityTable::Messages.has_index("by-conversation"));
        assert!(!EntityTable::Conversations.has_index("by-updated"));
    }
}
