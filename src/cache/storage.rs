//! Cache storage port and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::db;
use crate::error::StorageError;
use crate::net::Response;

/// A response read back from a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Storage port for version-scoped buckets of request/response pairs.
///
/// Stands in for the browser Cache Storage API so the router can be driven
/// without a browser runtime.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, bucket: &str) -> Result<(), StorageError>;

  /// Names of all existing buckets.
  fn buckets(&self) -> Result<Vec<String>, StorageError>;

  /// Delete a bucket and every entry in it. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool, StorageError>;

  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, StorageError>;

  /// Insert or overwrite an entry. Opens the bucket if needed.
  fn put(&self, bucket: &str, key: &str, response: &Response) -> Result<(), StorageError>;

  fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

  fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (bucket, request key). The key is stored hashed for a
-- fixed-length primary key, and verbatim for listing.
CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key_hash)
);
"#;

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: db::open(path, CACHE_SCHEMA)?,
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: db::open_in_memory(CACHE_SCHEMA)?,
    })
  }
}

/// SHA256 hash for stable, fixed-length keys
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, bucket: &str) -> Result<(), StorageError> {
    let conn = db::lock(&self.conn)?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_buckets (name) VALUES (?)",
      params![bucket],
    )?;
    Ok(())
  }

  fn buckets(&self) -> Result<Vec<String>, StorageError> {
    let conn = db::lock(&self.conn)?;
    let mut stmt = conn.prepare("SELECT name FROM cache_buckets ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
    let mut conn = db::lock(&self.conn)?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cache_entries WHERE bucket = ?", params![bucket])?;
    let removed = tx.execute("DELETE FROM cache_buckets WHERE name = ?", params![bucket])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, StorageError> {
    let conn = db::lock(&self.conn)?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket, hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body: body.into(),
        },
        cached_at: db::parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, key: &str, response: &Response) -> Result<(), StorageError> {
    let headers = serde_json::to_string(&response.headers)?;

    let mut conn = db::lock(&self.conn)?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO cache_buckets (name) VALUES (?)",
      params![bucket],
    )?;
    // Last writer wins: concurrent writes to one key store equivalent representations.
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (bucket, key_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        hash_key(key),
        key,
        response.status,
        headers,
        response.body.as_ref()
      ],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
    let conn = db::lock(&self.conn)?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE bucket = ? AND key_hash = ?",
      params![bucket, hash_key(key)],
    )?;
    Ok(removed > 0)
  }

  fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
    let conn = db::lock(&self.conn)?;
    let exists: Option<String> = conn
      .query_row(
        "SELECT name FROM cache_buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Err(StorageError::MissingBucket(bucket.to_string()));
    }

    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE bucket = ? ORDER BY request_key")?;
    let keys = stmt
      .query_map(params![bucket], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
  }
}
