//! ALFA Docs Vault - Conflict Store
//!
//! Pending conflict records persisted in SQLite so a restart cannot lose a
//! divergent version. Records only reference ciphertext; nothing in here
//! is plaintext.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::resolver::{ConflictRecord, ManualChoice};
use crate::error::{VaultError, VaultResult};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        detected_at TEXT NOT NULL,
        data BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS conflict_archive (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        archived_at TEXT NOT NULL,
        data BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(entity_id);
    CREATE INDEX IF NOT EXISTS idx_conflicts_pending ON conflicts(resolved, detected_at);
"#;

/// SQLite-backed conflict records
pub struct ConflictStore {
    conn: Mutex<Connection>,
}

impl ConflictStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> VaultResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> VaultResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> VaultResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a record
    pub fn save(&self, record: &ConflictRecord) -> VaultResult<()> {
        let conn = self.conn.lock();
        Self::write(&conn, record)
    }

    fn write(conn: &Connection, record: &ConflictRecord) -> VaultResult<()> {
        let data = serde_json::to_vec(record)?;
        conn.execute(
            "INSERT OR REPLACE INTO conflicts (id, entity_id, entity_type, resolved, detected_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.entity_id,
                record.entity_type.as_str(),
                record.resolved,
                record.detected_at.to_rfc3339(),
                data
            ],
        )?;
        Ok(())
    }

    /// Look a record up, including archived ones
    pub fn get(&self, id: &Uuid) -> VaultResult<ConflictRecord> {
        let conn = self.conn.lock();
        Self::find(&conn, id)?.ok_or(VaultError::ConflictNotFound(*id))
    }

    fn find(conn: &Connection, id: &Uuid) -> VaultResult<Option<ConflictRecord>> {
        let key = id.to_string();

        let data: Option<Vec<u8>> = conn
            .query_row("SELECT data FROM conflicts WHERE id = ?1", params![key], |row| row.get(0))
            .optional()?;

        let data = match data {
            Some(data) => Some(data),
            None => conn
                .query_row(
                    "SELECT data FROM conflict_archive WHERE id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?,
        };

        data.map(|d| serde_json::from_slice(&d).map_err(VaultError::from))
            .transpose()
    }

    /// Unresolved records, oldest first
    pub fn pending(&self) -> VaultResult<Vec<ConflictRecord>> {
        self.query(
            "SELECT data FROM conflicts WHERE resolved = 0 ORDER BY detected_at ASC",
            None,
        )
    }

    pub fn pending_for_entity(&self, entity_id: &str) -> VaultResult<Vec<ConflictRecord>> {
        self.query(
            "SELECT data FROM conflicts WHERE resolved = 0 AND entity_id = ?1 ORDER BY detected_at ASC",
            Some(entity_id),
        )
    }

    /// Resolved records for one entity, archived ones included
    pub fn resolved_for_entity(&self, entity_id: &str) -> VaultResult<Vec<ConflictRecord>> {
        self.query(
            "SELECT data FROM conflicts WHERE resolved = 1 AND entity_id = ?1
             UNION ALL
             SELECT data FROM conflict_archive WHERE entity_id = ?1",
            Some(entity_id),
        )
    }

    fn query(&self, sql: &str, entity_id: Option<&str>) -> VaultResult<Vec<ConflictRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;

        let rows: Vec<Vec<u8>> = match entity_id {
            Some(id) => stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<Result<_, _>>()?,
            None => stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?,
        };

        // a record that fails to parse is an error, not something to skip
        rows.iter()
            .map(|data| serde_json::from_slice(data).map_err(VaultError::from))
            .collect()
    }

    /// Apply the reviewer's choice. Resolving an already resolved record
    /// returns it unchanged.
    pub fn resolve(
        &self,
        id: &Uuid,
        choice: ManualChoice,
        now: DateTime<Utc>,
    ) -> VaultResult<ConflictRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut record = Self::find(&tx, id)?.ok_or(VaultError::ConflictNotFound(*id))?;
        if record.resolved {
            return Ok(record);
        }

        record.apply_choice(choice, now);
        Self::write(&tx, &record)?;
        tx.commit()?;

        Ok(record)
    }

    /// Move one resolved record to the archive
    pub fn archive(&self, id: &Uuid, now: DateTime<Utc>) -> VaultResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let moved = tx.execute(
            "INSERT OR REPLACE INTO conflict_archive (id, entity_id, archived_at, data)
             SELECT id, entity_id, ?2, data FROM conflicts WHERE id = ?1 AND resolved = 1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM conflicts WHERE id = ?1 AND resolved = 1",
            params![id.to_string()],
        )?;
        tx.commit()?;

        Ok(moved > 0)
    }

    /// Move every resolved record to the archive
    pub fn archive_resolved(&self, now: DateTime<Utc>) -> VaultResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let moved = tx.execute(
            "INSERT OR REPLACE INTO conflict_archive (id, entity_id, archived_at, data)
             SELECT id, entity_id, ?1, data FROM conflicts WHERE resolved = 1",
            params![now.to_rfc3339()],
        )?;
        tx.execute("DELETE FROM conflicts WHERE resolved = 1", [])?;
        tx.commit()?;

        if moved > 0 {
            log::info!("Archived {} resolved conflicts", moved);
        }
        Ok(moved)
    }

    pub fn pending_count(&self) -> VaultResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
