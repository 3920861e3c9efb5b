//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::key::RequestDescriptor;
use super::traits::Response;

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The snapshot as it was received
  pub response: Response,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Summary of one cache region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStats {
  pub name: String,
  pub entries: u64,
  pub body_bytes: u64,
}

/// Trait for cache storage backends.
///
/// Region-level operations (open/enumerate/delete) and entry-level
/// operations (match/put). All of them may fail; callers decide whether a
/// failure is fatal.
pub trait CacheStorage: Send + Sync {
  /// Names of all existing regions.
  fn region_names(&self) -> Result<Vec<String>>;

  /// Create the region if it does not exist yet.
  fn open_region(&self, region: &str) -> Result<()>;

  /// Delete a region and every entry in it. Returns whether it existed.
  fn delete_region(&self, region: &str) -> Result<bool>;

  /// Look up the snapshot stored for a descriptor.
  fn match_entry(&self, region: &str, key: &RequestDescriptor) -> Result<Option<CachedResponse>>;

  /// Insert or overwrite the snapshot for a descriptor, creating the region lazily.
  fn put_entry(&self, region: &str, key: &RequestDescriptor, response: &Response) -> Result<()>;

  /// Per-region entry counts and sizes.
  fn region_stats(&self) -> Result<Vec<RegionStats>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Upper bound on stored body bytes across all regions
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create a throwaway in-memory storage.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  /// Limit the total size of stored bodies.
  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("netfirst").join("cache.db"))
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
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Reject a write that would push stored bodies past the quota.
  ///
  /// The entry being replaced does not count against the new write.
  fn check_quota(
    &self,
    conn: &Connection,
    region: &str,
    entry_key: &str,
    body_len: usize,
  ) -> Result<()> {
    let Some(quota) = self.quota_bytes else {
      return Ok(());
    };

    let used: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(length(body)), 0) FROM cache_entries
         WHERE NOT (region = ? AND entry_key = ?)",
        params![region, entry_key],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to compute cache usage: {}", e))?;

    let needed = used.max(0) as u64 + body_len as u64;
    if needed > quota {
      return Err(eyre!(
        "Cache quota exceeded: {} bytes needed, {} allowed",
        needed,
        quota
      ));
    }

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named region (deployed version)
CREATE TABLE IF NOT EXISTS cache_regions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request descriptor hash
CREATE TABLE IF NOT EXISTS cache_entries (
    region TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    description TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (region, entry_key),
    FOREIGN KEY (region) REFERENCES cache_regions(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn region_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_regions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare region query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enumerate cache regions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache region: {}", e))?;

    Ok(names)
  }

  fn open_region(&self, region: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
        params![region],
      )
      .map_err(|e| eyre!("Failed to open cache region {}: {}", region, e))?;

    Ok(())
  }

  fn delete_region(&self, region: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE region = ?", params![region])
      .map_err(|e| eyre!("Failed to delete entries of region {}: {}", region, e))?;

    let removed = tx
      .execute("DELETE FROM cache_regions WHERE name = ?", params![region])
      .map_err(|e| eyre!("Failed to delete cache region {}: {}", region, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_entry(&self, region: &str, key: &RequestDescriptor) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE region = ? AND entry_key = ?",
        params![region, key.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.description(), e))?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let status = StatusCode::from_u16(status)
      .map_err(|e| eyre!("Invalid cached status {}: {}", status, e))?;
    let response = Response {
      status,
      headers: decode_headers(&headers)?,
      body: body.into(),
    };

    Ok(Some(CachedResponse {
      response,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put_entry(&self, region: &str, key: &RequestDescriptor, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let entry_key = key.cache_key();
    let headers = encode_headers(&response.headers)?;

    self.check_quota(&conn, region, &entry_key, response.body.len())?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
      params![region],
    )
    .map_err(|e| eyre!("Failed to open cache region {}: {}", region, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (region, entry_key, description, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        region,
        entry_key,
        key.description(),
        key.method(),
        key.url(),
        response.status.as_u16(),
        headers,
        response.body.as_ref()
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn region_stats(&self) -> Result<Vec<RegionStats>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT r.name, COUNT(e.entry_key), COALESCE(SUM(length(e.body)), 0)
         FROM cache_regions r
         LEFT JOIN cache_entries e ON e.region = r.name
         GROUP BY r.name
         ORDER BY r.name",
      )
      .map_err(|e| eyre!("Failed to prepare stats query: {}", e))?;

    let stats = stmt
      .query_map([], |row| {
        let entries: i64 = row.get(1)?;
        let body_bytes: i64 = row.get(2)?;
        Ok(RegionStats {
          name: row.get(0)?,
          entries: entries.max(0) as u64,
          body_bytes: body_bytes.max(0) as u64,
        })
      })
      .map_err(|e| eyre!("Failed to query region stats: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read region stats: {}", e))?;

    Ok(stats)
  }
}

/// Serialize headers as an ordered list of name/value pairs.
///
/// Values are kept as raw bytes; they are not required to be UTF-8.
fn encode_headers(headers: &HeaderMap) -> Result<String> {
  let pairs: Vec<(&str, &[u8])> = headers
    .iter()
    .map(|(name, value)| (name.as_str(), value.as_bytes()))
    .collect();

  serde_json::to_string(&pairs).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(s: &str) -> Result<HeaderMap> {
  let pairs: Vec<(String, Vec<u8>)> =
    serde_json::from_str(s).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  let mut headers = HeaderMap::with_capacity(pairs.len());
  for (name, value) in pairs {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid cached header name '{}': {}", name, e))?;
    let value = HeaderValue::from_bytes(&value)
      .map_err(|e| eyre!("Invalid cached header value for {}: {}", name, e))?;
    headers.append(name, value);
  }

  Ok(headers)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
