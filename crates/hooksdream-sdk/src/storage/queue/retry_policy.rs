use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HooksDreamSDKError;
use crate::utils::Timestamp;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 网络超时 / 连接中断 - 可重试
    Network(String),
    /// 服务端 5xx - 可重试
    ServerError(u16),
    /// 客户端 4xx（校验、认证、冲突）- 不重试
    Rejected(u16),
    /// 其他非 2xx 状态 - 可重试
    Unexpected(u16),
    /// 请求体无法编码 - 不重试
    Serialization(String),
}

impl FailureReason {
    /// 按 HTTP 状态码分类；2xx 返回 None
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            400..=499 => Some(FailureReason::Rejected(status)),
            500..=599 => Some(FailureReason::ServerError(status)),
            _ => Some(FailureReason::Unexpected(status)),
        }
    }

    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::Network(_) => true,
            FailureReason::ServerError(_) => true,
            FailureReason::Unexpected(_) => true,
            FailureReason::Rejected(_) => false,
            FailureReason::Serialization(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FailureReason::ServerError(s) | FailureReason::Rejected(s) | FailureReason::Unexpected(s) => Some(*s),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FailureReason::Network(e) => format!("network: {}", e),
            FailureReason::ServerError(s) => format!("server error {}", s),
            FailureReason::Rejected(s) => format!("rejected with {}", s),
            FailureReason::Unexpected(s) => format!("unexpected status {}", s),
            FailureReason::Serialization(e) => format!("serialization: {}", e),
        }
    }
}

impl From<&HooksDreamSDKError> for FailureReason {
    fn from(error: &HooksDreamSDKError) -> Self {
        match error {
            HooksDreamSDKError::PermanentRequest { status, .. } => FailureReason::Rejected(*status),
            HooksDreamSDKError::Serialization(e) => FailureReason::Serialization(e.clone()),
            // 其余错误（超时、连接失败、未知 IO）保守地按网络错误处理
            other => FailureReason::Network(other.to_string()),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，耗尽后按永久失败处理
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 随机抖动因子 (0.0-1.0)，只会缩短延迟
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5分钟
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 第 `retry_count` 次失败后的退避时间：min(max, base * 2^retry_count)
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let capped = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);

        let delay = if self.jitter_factor > 0.0 {
            let jitter = capped as f64 * self.jitter_factor.min(1.0) * rand::random::<f64>();
            (capped as f64 - jitter).max(0.0) as u64
        } else {
            capped
        };
        Duration::from_millis(delay)
    }

    /// 已失败 `retry_count` 次的操作最早何时可以再次尝试
    pub fn next_attempt_at(&self, retry_count: u32, last_attempt: Option<Timestamp>) -> Option<Timestamp> {
        if retry_count == 0 {
            return None;
        }
        let last = last_attempt?;
        let delay = self.backoff_delay(retry_count - 1);
        Some(last.saturating_add(delay.as_millis() as i64))
    }

    /// 检查是否应该重试（retry_count 为本次失败前的次数）
    pub fn should_retry(&self, retry_count: u32, reason: &FailureReason) -> bool {
        reason.is_retryable() && retry_count < self.max_retries
    }
}
