//! 实体缓存 DAO - users / posts / messages / conversations 共用
//!
//! 四张表结构相同（key, payload, updated_at, index_fields），表名来自 `EntityTable`。

use std::collections::BTreeMap;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::backend::PatchOutcome;
use crate::storage::entities::{EntityTable, RawEntity};
use crate::utils::Timestamp;

pub struct EntityDao<'a> {
    conn: &'a Connection,
    table: EntityTable,
}

/// 未解析的行
type EntityRow = (String, String, i64, String);

impl<'a> EntityDao<'a> {
    pub fn new(conn: &'a Connection, table: EntityTable) -> Self {
        Self { conn, table }
    }

    /// 单调 upsert：仅当新时间戳不早于已有值时覆盖
    pub fn upsert_if_newer(&self, entity: &RawEntity) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {t} (key, payload, updated_at, index_fields)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                index_fields = excluded.index_fields
            WHERE excluded.updated_at >= {t}.updated_at
            "#,
            t = self.table.as_str()
        );
        let changed = self.conn.execute(
            &sql,
            params![
                entity.key,
                serde_json::to_string(&entity.payload)?,
                entity.updated_at,
                serde_json::to_string(&entity.index_fields)?,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        self.write_index(&entity.key, &entity.index_fields)?;
        Ok(true)
    }

    /// 无条件覆盖（回滚用）
    pub fn replace(&self, entity: &RawEntity) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, payload, updated_at, index_fields) VALUES (?1, ?2, ?3, ?4)",
            self.table.as_str()
        );
        self.conn.execute(
            &sql,
            params![
                entity.key,
                serde_json::to_string(&entity.payload)?,
                entity.updated_at,
                serde_json::to_string(&entity.index_fields)?,
            ],
        )?;
        self.write_index(&entity.key, &entity.index_fields)
    }

    pub fn get(&self, key: &str) -> Result<Option<RawEntity>> {
        let sql = format!(
            "SELECT key, payload, updated_at, index_fields FROM {} WHERE key = ?1",
            self.table.as_str()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![key], row_to_entity)?;
        match rows.next().transpose()? {
            Some(row) => Ok(Some(parse_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_all(&self) -> Result<Vec<RawEntity>> {
        let sql = format!(
            "SELECT key, payload, updated_at, index_fields FROM {} ORDER BY key",
            self.table.as_str()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_entity)?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(parse_row).collect()
    }

    pub fn list_by_index(&self, index: &str, value: &str) -> Result<Vec<RawEntity>> {
        let sql = format!(
            r#"
            SELECT t.key, t.payload, t.updated_at, t.index_fields
            FROM {t} t
            JOIN entity_index i ON i.key = t.key
            WHERE i.tbl = ?1 AND i.idx = ?2 AND i.val = ?3
            ORDER BY t.key
            "#,
            t = self.table.as_str()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.table.as_str(), index, value], row_to_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(parse_row).collect()
    }

    pub fn updated_at(&self, key: &str) -> Result<Option<Timestamp>> {
        let sql = format!("SELECT updated_at FROM {} WHERE key = ?1", self.table.as_str());
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", self.table.as_str());
        let changed = self.conn.execute(&sql, params![key])?;
        self.conn.execute(
            "DELETE FROM entity_index WHERE tbl = ?1 AND key = ?2",
            params![self.table.as_str(), key],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_as_of(&self, key: &str, as_of: Timestamp) -> Result<PatchOutcome> {
        match self.updated_at(key)? {
            None => Ok(PatchOutcome::Missing),
            Some(current) if current > as_of => Ok(PatchOutcome::Stale),
            Some(_) => {
                self.delete(key)?;
                Ok(PatchOutcome::Applied)
            }
        }
    }

    fn write_index(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        self.conn.execute(
            "DELETE FROM entity_index WHERE tbl = ?1 AND key = ?2",
            params![self.table.as_str(), key],
        )?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO entity_index (tbl, idx, val, key) VALUES (?1, ?2, ?3, ?4)")?;
        for (idx, val) in fields {
            stmt.execute(params![self.table.as_str(), idx, val, key])?;
        }
        Ok(())
    }
}

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<EntityRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_row((key, payload, updated_at, index_fields): EntityRow) -> Result<RawEntity> {
    Ok(RawEntity {
        key,
        payload: serde_json::from_str(&payload)?,
        updated_at,
        index_fields: serde_json::from_str(&index_fields)?,
    })
}
