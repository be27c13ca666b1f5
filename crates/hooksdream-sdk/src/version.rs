//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Migration Version** → migrations 文件（文件即版本，由 refinery 管理）
//! - **Build Metadata** → build.rs（vergen）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 构建时间（vergen 在 build.rs 中生成；离线构建拿不到时为 "unknown"）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(v) => v,
    None => "unknown",
};

/// 当前 SDK 支持的最高数据库 migration 版本。
/// 由 build.rs 扫描 migrations/ 下 V{version}__*.sql 取最大值。
/// 启动时若 DB 版本 > 此值则拒绝打开。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 版本信息摘要，用于日志与诊断
pub fn version_summary() -> String {
    format!("hooksdream-sdk {} (db v{}, built {})", SDK_VERSION, SDK_DB_VERSION, BUILD_TIME)
}
