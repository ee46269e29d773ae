//! Persistence of dehydrated cache snapshots between process runs.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::hydration::{DehydratedQuery, DehydratedState};

/// Trait for snapshot storage backends.
pub trait CacheStorage: Send + Sync {
  /// Replace the stored snapshot with `state`.
  fn store_state(&self, state: &DehydratedState) -> Result<()>;

  /// Load the stored snapshot. Empty when nothing has been stored.
  fn load_state(&self) -> Result<DehydratedState>;

  /// Drop every stored query.
  fn clear(&self) -> Result<()>;
}

/// Storage that keeps nothing. Used when persistence is disabled.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn store_state(&self, _state: &DehydratedState) -> Result<()> {
    Ok(())
  }

  fn load_state(&self) -> Result<DehydratedState> {
    Ok(DehydratedState::default())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(path) => path.to_path_buf(),
      None => Self::default_path()?,
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    debug!(path = %path.display(), "opened cache database");

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("qcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dehydrated_queries (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    status TEXT NOT NULL,
    state BLOB NOT NULL,
    data_updated_at TEXT,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_state(&self, state: &DehydratedState) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM dehydrated_queries", [])
      .map_err(|e| eyre!("Failed to clear old snapshot: {}", e))?;

    for query in &state.queries {
      let key = serde_json::to_string(&query.query_key.to_value())
        .map_err(|e| eyre!("Failed to serialize query key: {}", e))?;
      let blob =
        serde_json::to_vec(query).map_err(|e| eyre!("Failed to serialize query: {}", e))?;
      let updated_at = query.state.data_updated_at.map(|at| at.to_rfc3339());

      tx.execute(
        "INSERT OR REPLACE INTO dehydrated_queries (query_hash, query_key, status, state, data_updated_at, stored_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![query.query_hash, key, query.state.status.as_str(), blob, updated_at],
      )
      .map_err(|e| eyre!("Failed to store query {}: {}", query.query_hash, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(count = state.queries.len(), "stored cache snapshot");
    Ok(())
  }

  fn load_state(&self) -> Result<DehydratedState> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT query_hash, state FROM dehydrated_queries ORDER BY query_hash")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
      .map_err(|e| eyre!("Failed to query snapshot: {}", e))?;

    let mut queries = Vec::new();
    for row in rows {
      let (hash, blob) = match row {
        Ok(row) => row,
        Err(e) => {
          warn!(error = %e, "skipping unreadable snapshot row");
          continue;
        }
      };
      match serde_json::from_slice::<DehydratedQuery>(&blob) {
        Ok(query) => queries.push(query),
        Err(e) => debug!(query_hash = %hash, error = %e, "skipping unreadable stored query"),
      }
    }

    Ok(DehydratedState { queries })
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM dehydrated_queries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryClient;
  use crate::config::EnvironmentMode;
  use crate::key::QueryKey;
  use crate::serializer::Payload;
  use chrono::{TimeZone, Utc};

  fn snapshot() -> DehydratedState {
    let client = QueryClient::new(EnvironmentMode::Production);
    client.set_query_data(
      &QueryKey::rpc(["user", "profile"], None),
      Payload::object([("seen", Payload::Date(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()))]),
    );
    client.set_query_data(&QueryKey::rpc(["feed"], Some(Payload::from(3))), Payload::Undefined);
    client.dehydrate()
  }

  #[test]
  fn test_empty_database_loads_empty_state() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.load_state().unwrap().is_empty());
  }

  #[test]
  fn test_store_and_load_snapshot() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let state = snapshot();
    storage.store_state(&state).unwrap();

    let mut loaded = storage.load_state().unwrap();
    let mut expected = state.queries.clone();
    expected.sort_by(|a, b| a.query_hash.cmp(&b.query_hash));
    loaded.queries.sort_by(|a, b| a.query_hash.cmp(&b.query_hash));
    assert_eq!(loaded.queries, expected);
  }

  #[test]
  fn test_store_replaces_previous_snapshot() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.store_state(&snapshot()).unwrap();
    storage.store_state(&DehydratedState::default()).unwrap();
    assert!(storage.load_state().unwrap().is_empty());
  }

  #[test]
  fn test_clear() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.store_state(&snapshot()).unwrap();
    storage.clear().unwrap();
    assert!(storage.load_state().unwrap().is_empty());
  }

  #[test]
  fn test_load_skips_malformed_rows() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.store_state(&snapshot()).unwrap();
    {
      let conn = storage.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO dehydrated_queries (query_hash, query_key, status, state) VALUES ('zz-text', '[]', 'success', 'not a blob')",
          [],
        )
        .unwrap();
      conn
        .execute(
          "INSERT INTO dehydrated_queries (query_hash, query_key, status, state) VALUES ('zz-json', '[]', 'success', X'7B7D')",
          [],
        )
        .unwrap();
    }

    let loaded = storage.load_state().unwrap();
    assert_eq!(loaded.queries.len(), 2);
    assert!(loaded.queries.iter().all(|q| !q.query_hash.starts_with("zz-")));
  }

  #[test]
  fn test_noop_storage_keeps_nothing() {
    let storage = NoopStorage;
    storage.store_state(&snapshot()).unwrap();
    assert!(storage.load_state().unwrap().is_empty());
  }

  #[test]
  fn test_open_creates_file() {
    let dir = std::env::temp_dir().join(format!("qcache-test-{}", std::process::id()));
    let path = dir.join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage.store_state(&snapshot()).unwrap();
    }
    let reopened = SqliteStorage::open(Some(&path)).unwrap();
    assert_eq!(reopened.load_state().unwrap().queries.len(), 2);
    let _ = std::fs::remove_dir_all(&dir);
  }
}
