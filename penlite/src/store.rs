//! Persistent instance store.
//!
//! Instance identity → configuration (+ last committed status) must
//! survive process restart; on startup the controller replays this table
//! and reconciles it against live native state before accepting
//! operations. Backed by a single rusqlite database in the controller
//! state directory, written through on every committed transition.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use crate::errors::{PenliteError, PenliteResult};
use crate::instance::{InstanceName, InstanceStatus};
use crate::options::InstanceConfig;

/// One persisted instance row.
#[derive(Debug, Clone)]
pub(crate) struct InstanceRecord {
    pub(crate) name: InstanceName,
    pub(crate) config: InstanceConfig,
    pub(crate) status: InstanceStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

/// SQLite-backed store of defined instances.
pub(crate) struct InstanceStore {
    conn: Mutex<Connection>,
}

impl InstanceStore {
    /// Open (creating if needed) the store at `path`.
    pub(crate) fn open(path: &Path) -> PenliteResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| PenliteError::Storage(format!("opening {}: {}", path.display(), e)))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                name       TEXT PRIMARY KEY,
                config     TEXT NOT NULL,
                status     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (tests).
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> PenliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                name       TEXT PRIMARY KEY,
                config     TEXT NOT NULL,
                status     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a newly defined instance.
    pub(crate) fn insert(
        &self,
        name: &InstanceName,
        config: &InstanceConfig,
        status: InstanceStatus,
    ) -> PenliteResult<()> {
        let config_json = serde_json::to_string(config)
            .map_err(|e| PenliteError::Storage(format!("serializing config: {}", e)))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .execute(
                "INSERT INTO instances (name, config, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name.as_str(), config_json, status.as_str(), now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    PenliteError::AlreadyExists(name.to_string())
                }
                e => e.into(),
            })?;
        Ok(())
    }

    /// Write through a committed status change.
    pub(crate) fn update_status(
        &self,
        name: &InstanceName,
        status: InstanceStatus,
    ) -> PenliteResult<()> {
        let changed = self.conn.lock().execute(
            "UPDATE instances SET status = ?2, updated_at = ?3 WHERE name = ?1",
            params![name.as_str(), status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(PenliteError::Storage(format!(
                "no stored instance named {}",
                name
            )));
        }
        Ok(())
    }

    /// Remove a destroyed instance's row.
    pub(crate) fn remove(&self, name: &InstanceName) -> PenliteResult<()> {
        self.conn.lock().execute(
            "DELETE FROM instances WHERE name = ?1",
            params![name.as_str()],
        )?;
        Ok(())
    }

    /// Load every stored instance (startup reconciliation).
    pub(crate) fn load_all(&self) -> PenliteResult<Vec<InstanceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, config, status, created_at, updated_at FROM instances")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let config: String = row.get(1)?;
            let status: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            let updated_at: String = row.get(4)?;
            Ok((name, config, status, created_at, updated_at))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (name, config_json, status, created_at, updated_at) = row?;
            records.push(InstanceRecord {
                name: InstanceName::parse(&name)
                    .map_err(|e| PenliteError::Storage(format!("stored name {}: {}", name, e)))?,
                config: serde_json::from_str(&config_json).map_err(|e| {
                    PenliteError::Storage(format!("stored config for {}: {}", name, e))
                })?,
                status: status.parse().map_err(|_| {
                    PenliteError::Storage(format!("stored status for {}: {}", name, status))
                })?,
                created_at: parse_timestamp(&created_at, &name)?,
                updated_at: parse_timestamp(&updated_at, &name)?,
            });
        }
        Ok(records)
    }
}

fn parse_timestamp(s: &str, name: &str) -> PenliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PenliteError::Storage(format!("stored timestamp for {}: {}", name, e)))
}
