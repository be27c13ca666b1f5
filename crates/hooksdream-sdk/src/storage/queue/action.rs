use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::entities::QueryKey;
use crate::utils::{now_millis, Timestamp};

/// 待同步操作 ID（入队时生成，不透明）
pub type ActionId = String;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreatePost,
    SendMessage,
    LikePost,
    FollowUser,
    UploadImage,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreatePost => "create-post",
            ActionKind::SendMessage => "send-message",
            ActionKind::LikePost => "like-post",
            ActionKind::FollowUser => "follow-user",
            ActionKind::UploadImage => "upload-image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create-post" => Some(ActionKind::CreatePost),
            "send-message" => Some(ActionKind::SendMessage),
            "like-post" => Some(ActionKind::LikePost),
            "follow-user" => Some(ActionKind::FollowUser),
            "upload-image" => Some(ActionKind::UploadImage),
            _ => None,
        }
    }

    /// 后台同步标签（平台按标签分配后台执行时段）
    pub fn sync_tag(&self) -> &'static str {
        match self {
            ActionKind::CreatePost => "background-sync-posts",
            ActionKind::SendMessage => "background-sync-messages",
            ActionKind::LikePost | ActionKind::FollowUser => "background-sync-interactions",
            ActionKind::UploadImage => "background-sync-uploads",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostPayload {
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    /// 本地占位条目的键（如果有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikePostPayload {
    pub post_id: String,
    /// 目标状态：true 点赞，false 取消
    pub like: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUserPayload {
    pub user_id: String,
    /// 目标状态：true 关注，false 取消关注
    pub follow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImagePayload {
    pub file_name: String,
    pub content_type: String,
    pub local_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
}

/// 操作内容，按 `kind` 区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ActionPayload {
    CreatePost(CreatePostPayload),
    SendMessage(SendMessagePayload),
    LikePost(LikePostPayload),
    FollowUser(FollowUserPayload),
    UploadImage(UploadImagePayload),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::CreatePost(_) => ActionKind::CreatePost,
            ActionPayload::SendMessage(_) => ActionKind::SendMessage,
            ActionPayload::LikePost(_) => ActionKind::LikePost,
            ActionPayload::FollowUser(_) => ActionKind::FollowUser,
            ActionPayload::UploadImage(_) => ActionKind::UploadImage,
        }
    }

    /// 逻辑目标：同一目标的操作必须按入队顺序同步
    pub fn ordering_key(&self) -> String {
        match self {
            ActionPayload::CreatePost(_) => "posts:create".to_string(),
            ActionPayload::SendMessage(p) => format!("conversations/{}", p.conversation_id),
            ActionPayload::LikePost(p) => format!("posts/{}", p.post_id),
            ActionPayload::FollowUser(p) => format!("users/{}", p.user_id),
            ActionPayload::UploadImage(p) => format!("uploads/{}", p.local_path),
        }
    }

    /// 该操作乐观修改的缓存条目
    pub fn query_key(&self) -> Option<QueryKey> {
        match self {
            ActionPayload::LikePost(p) => Some(QueryKey::post(&p.post_id)),
            ActionPayload::FollowUser(p) => Some(QueryKey::user(&p.user_id)),
            ActionPayload::CreatePost(p) => p.client_id.as_ref().map(QueryKey::post),
            ActionPayload::SendMessage(p) => p.client_id.as_ref().map(QueryKey::message),
            ActionPayload::UploadImage(_) => None,
        }
    }

    /// 请求体
    pub fn request_body(&self) -> Result<Value> {
        let body = match self {
            ActionPayload::CreatePost(p) => serde_json::to_value(p)?,
            ActionPayload::SendMessage(p) => serde_json::to_value(p)?,
            ActionPayload::LikePost(p) => serde_json::to_value(p)?,
            ActionPayload::FollowUser(p) => serde_json::to_value(p)?,
            ActionPayload::UploadImage(p) => serde_json::to_value(p)?,
        };
        Ok(body)
    }
}

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// 请求体编码
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum BodyEncoding {
    #[default]
    Json,
    /// multipart 表单，`localPath` 指向的文件放在 `file_field` 字段
    Multipart { file_field: String },
}

/// 请求目标，入队时完全确定，回放时不依赖当前会话状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub encoding: BodyEncoding,
}

impl EndpointDescriptor {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            encoding: BodyEncoding::Json,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_multipart(mut self, file_field: impl Into<String>) -> Self {
        self.encoding = BodyEncoding::Multipart {
            file_field: file_field.into(),
        };
        self
    }

    pub fn with_bearer(self, token: Option<&str>) -> Self {
        match token {
            Some(token) => self.with_header("Authorization", format!("Bearer {}", token)),
            None => self,
        }
    }
}

/// 待同步操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub payload: ActionPayload,
    pub target: EndpointDescriptor,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub last_attempt: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn new(payload: ActionPayload, target: EndpointDescriptor) -> Self {
        let created_at = now_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}-{}", payload.kind(), created_at, &suffix[..9]),
            payload,
            target,
            retry_count: 0,
            created_at,
            last_attempt: None,
            last_error: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}
