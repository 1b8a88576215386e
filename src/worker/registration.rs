//! Which worker version controls pages and which one is waiting.

use color_eyre::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::db;
use crate::error::StorageError;

/// Persisted registration slots.
pub struct Registration {
  conn: Mutex<Connection>,
}

const REGISTRATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS registration (
    slot TEXT PRIMARY KEY CHECK (slot IN ('active', 'waiting')),
    version TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl Registration {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: db::open(path, REGISTRATION_SCHEMA)?,
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: db::open_in_memory(REGISTRATION_SCHEMA)?,
    })
  }

  fn slot(&self, slot: &str) -> Result<Option<String>, StorageError> {
    let conn = db::lock(&self.conn)?;
    let version = conn
      .query_row(
        "SELECT version FROM registration WHERE slot = ?",
        params![slot],
        |row| row.get(0),
      )
      .optional()?;
    Ok(version)
  }

  /// Version currently controlling pages.
  pub fn active(&self) -> Result<Option<String>, StorageError> {
    self.slot("active")
  }

  /// Installed version waiting for the active one to let go.
  pub fn waiting(&self) -> Result<Option<String>, StorageError> {
    self.slot("waiting")
  }

  pub fn set_waiting(&self, version: &str) -> Result<(), StorageError> {
    let conn = db::lock(&self.conn)?;
    conn.execute(
      "INSERT OR REPLACE INTO registration (slot, version, updated_at)
       VALUES ('waiting', ?, datetime('now'))",
      params![version],
    )?;
    Ok(())
  }

  /// Make `version` the active one and clear the waiting slot.
  ///
  /// Returns the version that was active before.
  pub fn promote(&self, version: &str) -> Result<Option<String>, StorageError> {
    let mut conn = db::lock(&self.conn)?;
    let tx = conn.transaction()?;
    let previous: Option<String> = tx
      .query_row(
        "SELECT version FROM registration WHERE slot = 'active'",
        [],
        |row| row.get(0),
      )
      .optional()?;
    tx.execute("DELETE FROM registration WHERE slot = 'waiting'", [])?;
    tx.execute(
      "INSERT OR REPLACE INTO registration (slot, version, updated_at)
       VALUES ('active', ?, datetime('now'))",
      params![version],
    )?;
    tx.commit()?;
    Ok(previous)
  }
}
