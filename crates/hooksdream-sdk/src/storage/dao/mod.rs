//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! DAO 只借用连接（或事务），不负责开启事务；事务边界由 `SqliteBackend` 控制。

pub mod entity;
pub mod pending_action;

pub use entity::EntityDao;
pub use pending_action::PendingActionDao;

use rusqlite::Connection;

use crate::error::Result;

/// 事务管理器 - 在一个事务内执行闭包，出错时事务随 drop 回滚
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 执行事务操作
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
