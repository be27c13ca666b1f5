use rusqlite::ErrorCode;
use thiserror::Error;

/// SDK 统一错误类型
///
/// 前五个变体是同步引擎的错误分类：存储不可用降级为内存、瞬时网络错误重试、
/// 4xx 永久失败直接移除、序列化失败直接丢弃、能力被拒绝只记录状态。
#[derive(Debug, Error)]
pub enum HooksDreamSDKError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Permanent request error [{status}]: {message}")]
    PermanentRequest { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl HooksDreamSDKError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, HooksDreamSDKError::TransientNetwork(_))
    }

    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, HooksDreamSDKError::StorageUnavailable(_))
    }

    /// 错误分类名，用于事件和日志
    pub fn kind(&self) -> &'static str {
        match self {
            HooksDreamSDKError::StorageUnavailable(_) => "storage_unavailable",
            HooksDreamSDKError::TransientNetwork(_) => "transient_network",
            HooksDreamSDKError::PermanentRequest { .. } => "permanent_request",
            HooksDreamSDKError::Serialization(_) => "serialization",
            HooksDreamSDKError::CapabilityDenied(_) => "capability_denied",
            HooksDreamSDKError::Database(_) => "database",
            HooksDreamSDKError::KvStore(_) => "kv_store",
            HooksDreamSDKError::IO(_) => "io",
            HooksDreamSDKError::InvalidArgument(_) => "invalid_argument",
            HooksDreamSDKError::Config(_) => "config",
            HooksDreamSDKError::ShuttingDown(_) => "shutting_down",
            HooksDreamSDKError::Other(_) => "other",
        }
    }
}

impl From<rusqlite::Error> for HooksDreamSDKError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DiskFull
                        | ErrorCode::CannotOpen
                        | ErrorCode::ReadOnly
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::PermissionDenied
                        | ErrorCode::NotADatabase
                ) =>
            {
                HooksDreamSDKError::StorageUnavailable(error.to_string())
            }
            _ => HooksDreamSDKError::Database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for HooksDreamSDKError {
    fn from(error: serde_json::Error) -> Self {
        HooksDreamSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for HooksDreamSDKError {
    fn from(error: std::io::Error) -> Self {
        HooksDreamSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for HooksDreamSDKError {
    fn from(error: sled::Error) -> Self {
        HooksDreamSDKError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HooksDreamSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_storage_failures_map_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            Some("database or disk is full".to_string()),
        );
        let mapped: HooksDreamSDKError = err.into();
        assert!(mapped.is_storage_unavailable());

        let other: HooksDreamSDKError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(other.kind(), "database");
    }

    #[test]
    fn test_json_error_is_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let mapped: HooksDreamSDKError = err.into();
        assert_eq!(mapped.kind(), "serialization");
        assert!(!mapped.is_transient());
    }
}
