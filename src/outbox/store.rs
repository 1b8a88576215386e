//! Durable store for pending write operations.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db;
use crate::error::{OutboxError, StorageError};

/// A write the page could not deliver, waiting to be replayed.
///
/// Never mutated once queued: it is either present or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: Uuid,
  /// Logical operation name, e.g. "create_project"
  pub target: String,
  /// Opaque JSON body replayed as-is
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

impl PendingOperation {
  pub fn new(target: impl Into<String>, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      target: target.into(),
      payload,
      created_at: Utc::now(),
    }
  }
}

/// Storage port for the outbox queue.
pub trait OutboxStore: Send + Sync {
  /// Append an operation. Duplicate ids are rejected.
  fn append(&self, operation: &PendingOperation) -> Result<(), StorageError>;

  /// All queued operations in insertion order.
  ///
  /// Fails with `OutboxError::Corrupt` if any entry cannot be decoded.
  fn pending(&self) -> Result<Vec<PendingOperation>, OutboxError>;

  /// Lease one entry to `owner` until `until`, so no other drain replays it.
  ///
  /// Returns false if the entry is gone or another drain holds a live lease.
  /// Expired leases can be taken over.
  fn claim(&self, id: Uuid, owner: &str, until: DateTime<Utc>) -> Result<bool, StorageError>;

  /// Drop `owner`'s lease so the next drain retries the entry.
  fn release(&self, id: Uuid, owner: &str) -> Result<(), StorageError>;

  /// Atomically delete one entry. Returns false if it was already gone.
  fn remove(&self, id: Uuid) -> Result<bool, StorageError>;

  fn len(&self) -> Result<usize, StorageError>;
}

/// SQLite-backed outbox; survives process restarts.
pub struct SqliteOutbox {
  conn: Mutex<Connection>,
}

const OUTBOX_SCHEMA: &str = r#"
-- seq preserves insertion order independently of the random id.
-- claimed_until is a unix timestamp in milliseconds; NULL means unclaimed.
CREATE TABLE IF NOT EXISTS pending_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    target TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    claimed_by TEXT,
    claimed_until INTEGER
);
"#;

impl SqliteOutbox {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: db::open(path, OUTBOX_SCHEMA)?,
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: db::open_in_memory(OUTBOX_SCHEMA)?,
    })
  }
}

fn corrupt(id: &str, what: &str, e: impl std::fmt::Display) -> OutboxError {
  OutboxError::Corrupt(format!("entry {}: bad {}: {}", id, what, e))
}

fn decode(
  id: &str,
  target: String,
  payload: &str,
  created_at: &str,
) -> Result<PendingOperation, OutboxError> {
  Ok(PendingOperation {
    id: Uuid::parse_str(id).map_err(|e| corrupt(id, "id", e))?,
    target,
    payload: serde_json::from_str(payload).map_err(|e| corrupt(id, "payload", e))?,
    created_at: DateTime::parse_from_rfc3339(created_at)
      .map_err(|e| corrupt(id, "created_at", e))?
      .with_timezone(&Utc),
  })
}

impl OutboxStore for SqliteOutbox {
  fn append(&self, operation: &PendingOperation) -> Result<(), StorageError> {
    let payload = serde_json::to_string(&operation.payload)?;
    let conn = db::lock(&self.conn)?;
    conn.execute(
      "INSERT INTO pending_operations (id, target, payload, created_at) VALUES (?, ?, ?, ?)",
      params![
        operation.id.to_string(),
        operation.target,
        payload,
        operation.created_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn pending(&self) -> Result<Vec<PendingOperation>, OutboxError> {
    let conn = db::lock(&self.conn)?;
    let mut stmt = conn
      .prepare("SELECT id, target, payload, created_at FROM pending_operations ORDER BY seq")
      .map_err(StorageError::from)?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(StorageError::from)?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| OutboxError::Corrupt(e.to_string()))?;

    rows
      .into_iter()
      .map(|(id, target, payload, created_at)| decode(&id, target, &payload, &created_at))
      .collect()
  }

  fn claim(&self, id: Uuid, owner: &str, until: DateTime<Utc>) -> Result<bool, StorageError> {
    let conn = db::lock(&self.conn)?;
    // One UPDATE, so two connections cannot both win the same row
    let claimed = conn.execute(
      "UPDATE pending_operations SET claimed_by = ?1, claimed_until = ?2
       WHERE id = ?3 AND (claimed_until IS NULL OR claimed_until <= ?4)",
      params![
        owner,
        until.timestamp_millis(),
        id.to_string(),
        Utc::now().timestamp_millis()
      ],
    )?;
    Ok(claimed > 0)
  }

  fn release(&self, id: Uuid, owner: &str) -> Result<(), StorageError> {
    let conn = db::lock(&self.conn)?;
    conn.execute(
      "UPDATE pending_operations SET claimed_by = NULL, claimed_until = NULL
       WHERE id = ? AND claimed_by = ?",
      params![id.to_string(), owner],
    )?;
    Ok(())
  }

  fn remove(&self, id: Uuid) -> Result<bool, StorageError> {
    let conn = db::lock(&self.conn)?;
    let removed = conn.execute(
      "DELETE FROM pending_operations WHERE id = ?",
      params![id.to_string()],
    )?;
    Ok(removed > 0)
  }

  fn len(&self) -> Result<usize, StorageError> {
    let conn = db::lock(&self.conn)?;
    let count: i64 =
      conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_pending_preserves_insertion_order() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let ops: Vec<_> = (0..5)
      .map(|i| PendingOperation::new("create_project", json!({ "n": i })))
      .collect();
    for op in &ops {
      store.append(op).unwrap();
    }

    assert_eq!(store.pending().unwrap(), ops);
    assert_eq!(store.len().unwrap(), 5);
  }

  #[test]
  fn test_duplicate_id_is_rejected() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let op = PendingOperation::new("fund_project", json!({ "amount": 10 }));
    store.append(&op).unwrap();
    assert!(store.append(&op).is_err());
    assert_eq!(store.len().unwrap(), 1);
  }

  #[test]
  fn test_remove_is_idempotent() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let op = PendingOperation::new("comment", json!("hello"));
    store.append(&op).unwrap();

    assert!(store.remove(op.id).unwrap());
    assert!(!store.remove(op.id).unwrap());
    assert!(store.pending().unwrap().is_empty());
  }

  #[test]
  fn test_undecodable_entry_is_corrupt() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    store
      .append(&PendingOperation::new("ok", json!({})))
      .unwrap();
    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO pending_operations (id, target, payload, created_at)
           VALUES ('not-a-uuid', 'x', '{', 'yesterday')",
          [],
        )
        .unwrap();
    }

    assert!(matches!(store.pending(), Err(OutboxError::Corrupt(_))));
  }

  fn lease() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(60)
  }

  #[test]
  fn test_claim_is_exclusive_until_released() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let op = PendingOperation::new("fund_project", json!({ "amount": 25 }));
    store.append(&op).unwrap();

    assert!(store.claim(op.id, "drain-a", lease()).unwrap());
    assert!(!store.claim(op.id, "drain-b", lease()).unwrap());

    // Only the holder can release
    store.release(op.id, "drain-b").unwrap();
    assert!(!store.claim(op.id, "drain-b", lease()).unwrap());

    store.release(op.id, "drain-a").unwrap();
    assert!(store.claim(op.id, "drain-b", lease()).unwrap());
    // Claimed entries are still pending until removed
    assert_eq!(store.pending().unwrap(), vec![op]);
  }

  #[test]
  fn test_expired_claim_can_be_taken_over() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let op = PendingOperation::new("comment", json!("late"));
    store.append(&op).unwrap();

    let expired = Utc::now() - chrono::Duration::seconds(1);
    assert!(store.claim(op.id, "crashed-drain", expired).unwrap());
    assert!(store.claim(op.id, "drain-b", lease()).unwrap());
  }

  #[test]
  fn test_claim_of_removed_entry_fails() {
    let store = SqliteOutbox::open_in_memory().unwrap();
    let op = PendingOperation::new("comment", json!("gone"));
    store.append(&op).unwrap();
    store.remove(op.id).unwrap();

    assert!(!store.claim(op.id, "drain-a", lease()).unwrap());
  }

  #[test]
  fn test_claims_are_shared_between_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");
    let first = SqliteOutbox::open(&path).unwrap();
    let second = SqliteOutbox::open(&path).unwrap();
    let op = PendingOperation::new("create_project", json!({ "title": "Drone" }));
    first.append(&op).unwrap();

    assert!(first.claim(op.id, "process-1", lease()).unwrap());
    assert!(!second.claim(op.id, "process-2", lease()).unwrap());
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    let op = PendingOperation::new("create_project", json!({ "title": "Arduino kit" }));

    {
      let store = SqliteOutbox::open(&path).unwrap();
      store.append(&op).unwrap();
    }

    let store = SqliteOutbox::open(&path).unwrap();
    assert_eq!(store.pending().unwrap(), vec![op]);
  }
}
