//! 时间工具
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **业务层**: 统一使用 `now_millis()` 生成时间
//! - **协议层**: 服务端推送的 ISO-8601 字符串在进入缓存前转为毫秒

use chrono::{DateTime, Utc};
use serde_json::Value;

/// UTC 毫秒时间戳
pub type Timestamp = i64;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// 生成一个严格晚于 `previous` 且不早于当前时间的时间戳
///
/// 乐观写入和服务端确认写入都用它，保证新值一定能覆盖缓存中的旧值。
pub fn stamp_after(previous: Option<Timestamp>) -> Timestamp {
    let now = now_millis();
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

/// 解析推送事件里的时间字段，支持 ISO-8601 字符串和毫秒数字
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// 天数转毫秒
pub fn days_to_millis(days: u32) -> i64 {
    i64::from(days) * 24 * 60 * 60 * 1000
}
