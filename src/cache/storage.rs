//! Cache storage traits and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::http::Response;
use crate::sync::SyncTask;

/// A stored response and the time it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub response: Response,
  /// Taken from the response's `date` header when present
  pub captured_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Capture a network response, stamping it with its own date header.
  pub fn capture(response: Response) -> Self {
    let captured_at = response.date().unwrap_or_else(Utc::now);
    Self {
      response,
      captured_at,
    }
  }

  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.captured_at
  }
}

/// Trait for partitioned response storage.
///
/// Entries within a partition are ordered by insertion; an overwrite counts as
/// a new insertion.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if missing. Returns true if it was created.
  fn ensure_partition(&self, name: &str) -> Result<bool>;

  /// Names of every durable partition.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Drop a partition and all its entries. Returns false if it didn't exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Insert or overwrite one entry, creating the partition if needed.
  fn put(&self, partition: &str, key: &str, entry: &CachedEntry) -> Result<()>;

  /// Insert several entries atomically, in order.
  fn put_all(&self, partition: &str, entries: &[(String, CachedEntry)]) -> Result<()>;

  fn count(&self, partition: &str) -> Result<usize>;

  /// Request keys of a partition, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Delete the oldest entries until at most `max_entries` remain.
  /// Returns the number of entries evicted.
  fn trim(&self, partition: &str, max_entries: usize) -> Result<usize>;
}

/// Trait for the durable sync task queue.
pub trait SyncStore: Send + Sync + 'static {
  /// Append a task, returning its id.
  fn push_task(&self, tag: &str, payload: &serde_json::Value) -> Result<i64>;

  /// Pending tasks in creation order, optionally restricted to one tag.
  fn pending_tasks(&self, tag: Option<&str>) -> Result<Vec<SyncTask>>;

  fn delete_task(&self, id: i64) -> Result<()>;
}

/// SQLite-based storage for both partitions and sync tasks.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache partitions (one row per generation-qualified name)
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses; seq is the global insertion order used for eviction
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(partition, seq);

-- Deferred mutations, outside any partition
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_tag ON sync_tasks(tag, id);
"#;

const INSERT_ENTRY: &str = "INSERT OR REPLACE INTO entries
  (partition, key_hash, request_key, seq, status, headers, body, captured_at)
  VALUES (?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries), ?, ?, ?, ?)";

impl CacheStorage for SqliteStorage {
  fn ensure_partition(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;

    Ok(inserted > 0)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, captured_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, captured_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          captured_at: parse_datetime(&captured_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &str, entry: &CachedEntry) -> Result<()> {
    self.put_all(partition, &[(key.to_string(), entry.clone())])
  }

  fn put_all(&self, partition: &str, entries: &[(String, CachedEntry)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    for (key, entry) in entries {
      let headers = serde_json::to_string(&entry.response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        INSERT_ENTRY,
        params![
          partition,
          hash_key(key),
          key,
          entry.response.status,
          headers,
          entry.response.body,
          entry.captured_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn trim(&self, partition: &str, max_entries: usize) -> Result<usize> {
    let count = self.count(partition)?;
    if count <= max_entries {
      return Ok(0);
    }

    let excess = count - max_entries;
    let conn = self.conn()?;
    let evicted = conn
      .execute(
        "DELETE FROM entries WHERE partition = ?1 AND key_hash IN (
           SELECT key_hash FROM entries WHERE partition = ?1 ORDER BY seq LIMIT ?2
         )",
        params![partition, excess as i64],
      )
      .map_err(|e| eyre!("Failed to evict from {}: {}", partition, e))?;

    Ok(evicted)
  }
}

impl SyncStore for SqliteStorage {
  fn push_task(&self, tag: &str, payload: &serde_json::Value) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO sync_tasks (tag, payload, created_at) VALUES (?, ?, ?)",
        params![tag, payload.to_string(), Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store sync task: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending_tasks(&self, tag: Option<&str>) -> Result<Vec<SyncTask>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, tag, payload, created_at FROM sync_tasks
         WHERE ?1 IS NULL OR tag = ?1
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, tag, payload, created_at)| {
        Ok(SyncTask {
          id,
          tag,
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Failed to deserialize sync task {}: {}", id, e))?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn delete_task(&self, id: i64) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete sync task {}: {}", id, e))?;

    Ok(())
  }
}

/// SHA256 of the request identity, for fixed-length primary keys.
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
