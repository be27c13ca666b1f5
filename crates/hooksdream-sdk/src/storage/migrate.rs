//! 数据库迁移与初始化 - 由 refinery 自动管理
//!
//! - Migration 版本 = migrations 文件顺序。
//! - 统一入口 `init_db`：pragmas → migrate → 版本校验，在服务任何请求之前完成。
//! - 新增迁移只需在 migrations/ 添加 V{n}__{name}.sql，编译期自动嵌入。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;
use tracing::info;

use crate::error::{HooksDreamSDKError, Result};
use crate::version::SDK_DB_VERSION;

/// refinery 使用的 migration 历史表名
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 缓存场景 PRAGMA：WAL、NORMAL 同步、内存临时表
const CACHE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(CACHE_PRAGMAS.trim())?;
    Ok(())
}

/// 执行内置 migrations（编译期嵌入，按版本顺序执行）
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| HooksDreamSDKError::Database(format!("执行 migration 失败: {}", e)))?;
    for applied in report.applied_migrations() {
        info!("🔄 已应用 migration: V{}__{}", applied.version(), applied.name());
    }
    Ok(())
}

/// 读取当前数据库的 migration 版本；无表或空表返回 None
pub fn get_db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [REFINERY_TABLE],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn.query_row(
        &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
        [],
        |row| row.get::<_, Option<i64>>(0),
    )?;

    Ok(version.filter(|&v| v > 0))
}

/// 若 DB 版本 > 当前 SDK 支持的最高版本，拒绝使用
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = get_db_migration_version(conn)? else {
        return Ok(());
    };
    if v > SDK_DB_VERSION {
        return Err(HooksDreamSDKError::Database(format!(
            "数据库版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

/// 统一初始化入口
pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    check_db_version(conn)?;
    run_migrations(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db_creates_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();

        assert_eq!(get_db_migration_version(&conn).unwrap(), Some(SDK_DB_VERSION));
        let has_last_error: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('pending_actions') WHERE name = 'last_error'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(has_last_error);

        // 再次初始化是幂等的
        init_db(&mut conn).unwrap();
    }

    #[test]
    fn test_rejects_newer_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'future', '', '0')",
                REFINERY_TABLE
            ),
            [SDK_DB_VERSION + 1],
        )
        .unwrap();

        let err = init_db(&mut conn).unwrap_err();
        assert_eq!(err.kind(), "database");
    }
}
