//! Compliance audit log.
//!
//! Every chat message handled by the engine is appended here before it is
//! scored. The log is append-only and best-effort from the engine's point
//! of view: a failed append is logged and the message flow continues.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// One audited message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub room_id: String,
    pub user_id: String,
    pub message: String,
    pub timestamp: u64,
}

/// Append-only audit sink.
pub trait AuditLog: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<()>;
}

/// In-memory audit sink, mostly for tests and single-process setups.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| SentinelError::storage("audit log lock poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub use self::sqlite::SqliteAuditLog;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::path::Path;

    use rusqlite::{params, Connection};

    use super::*;

    /// SQLite-backed audit sink.
    pub struct SqliteAuditLog {
        conn: Mutex<Connection>,
    }

    impl SqliteAuditLog {
        /// Open (or create) the audit database at `path`.
        pub fn open(path: &Path) -> Result<Self> {
            let conn = Connection::open(path)
                .map_err(|e| SentinelError::storage(format!("open audit db: {}", e)))?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    message TEXT NOT NULL,
                    timestamp INTEGER NOT NULL
                )",
                [],
            )
            .map_err(|e| SentinelError::storage(format!("create audit table: {}", e)))?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    impl AuditLog for SqliteAuditLog {
        fn append(&self, entry: &AuditEntry) -> Result<()> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SentinelError::storage("audit connection lock poisoned"))?;
            conn.execute(
                "INSERT INTO audit_log (room_id, user_id, message, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.room_id,
                    entry.user_id,
                    entry.message,
                    entry.timestamp as i64
                ],
            )
            .map_err(|e| SentinelError::transient(format!("audit insert: {}", e)))?;
            Ok(())
        }
    }
}
