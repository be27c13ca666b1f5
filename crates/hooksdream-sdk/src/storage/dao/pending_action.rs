//! 待同步操作 DAO - pending_actions 表

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::backend::StoredAction;
use crate::utils::Timestamp;

const SELECT_COLUMNS: &str =
    "SELECT id, kind, payload, target, retry_count, created_at, last_attempt, last_error FROM pending_actions";

pub struct PendingActionDao<'a> {
    conn: &'a Connection,
}

impl<'a> PendingActionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, action: &StoredAction) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO pending_actions (id, kind, payload, target, retry_count, created_at, last_attempt, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                action.id,
                action.kind,
                action.payload,
                action.target,
                action.retry_count,
                action.created_at,
                action.last_attempt,
                action.last_error,
            ],
        )?;
        Ok(())
    }

    /// 按入队顺序（seq 自增）列出
    pub fn list(&self) -> Result<Vec<StoredAction>> {
        let mut stmt = self.conn.prepare(&format!("{} ORDER BY seq ASC", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], row_to_action)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredAction>> {
        let mut stmt = self.conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let mut rows = stmt.query_map(params![id], row_to_action)?;
        Ok(rows.next().transpose()?)
    }

    pub fn mark_failed(&self, id: &str, attempted_at: Timestamp, error: &str) -> Result<Option<u32>> {
        let changed = self.conn.execute(
            r#"
            UPDATE pending_actions
            SET retry_count = retry_count + 1, last_attempt = ?2, last_error = ?3
            WHERE id = ?1
            "#,
            params![id, attempted_at, error],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let retry_count: u32 = self.conn.query_row(
            "SELECT retry_count FROM pending_actions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(retry_count))
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM pending_actions", [])?)
    }
}

fn row_to_action(row: &rusqlite::Row) -> rusqlite::Result<StoredAction> {
    Ok(StoredAction {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: row.get(2)?,
        target: row.get(3)?,
        retry_count: row.get(4)?,
        created_at: row.get(5)?,
        last_attempt: row.get(6)?,
        last_error: row.get(7)?,
    })
}
