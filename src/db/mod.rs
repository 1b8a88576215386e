use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StorageError;

/// Page context (enqueue) and worker context (drain, fetch) may hold the
/// same database file open at once.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open or create the database at `path` and run `schema` against it.
pub fn open(path: &Path, schema: &str) -> Result<Mutex<Connection>> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
  conn
    .busy_timeout(BUSY_TIMEOUT)
    .map_err(|e| eyre!("Failed to configure database: {}", e))?;
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
    .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

  run_migrations(&conn, schema)?;
  Ok(Mutex::new(conn))
}

/// Open a throwaway in-memory database.
#[cfg(test)]
pub fn open_in_memory(schema: &str) -> Result<Mutex<Connection>> {
  let conn = Connection::open_in_memory()
    .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  run_migrations(&conn, schema)?;
  Ok(Mutex::new(conn))
}

fn run_migrations(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))
}

pub fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
  conn
    .lock()
    .map_err(|e| StorageError::Poisoned(e.to_string()))
}

/// Parse a datetime string from SQLite format.
pub fn parse_datetime(s: &str) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| {
      StorageError::Backend(rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(e),
      ))
    })
}
