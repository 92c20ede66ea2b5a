//! Cache storage implementations: SQLite on disk and an in-process map.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::traits::{Cache, CacheStorage, CachedResponse, Request};

/// SQLite-based cache storage implementation.
///
/// Every named cache lives in the same database file; opening a name that
/// does not exist yet creates it.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the storage at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    debug!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  /// Open a storage that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("precache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = lock(&self.conn)?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named caches, id gives creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request URL
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_id, url),
    FOREIGN KEY (cache_id) REFERENCES caches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);
"#;

const ENTRY_COLUMNS: &str = "e.response_url, e.status, e.status_text, e.headers, e.body, e.cached_at";

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
  conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

/// Raw column values of one cache entry, decoded after the row is released.
type EntryRow = (String, u16, String, String, Vec<u8>, String);

fn read_entry_row(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_entry(row: EntryRow) -> Result<CachedResponse> {
  let (url, status, status_text, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

  Ok(CachedResponse {
    url,
    status,
    status_text,
    headers,
    body,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  type Handle = SqliteCache;

  fn open(&self, name: &str) -> Result<SqliteCache> {
    let conn = lock(&self.conn)?;

    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;

    let id: i64 = conn
      .query_row(
        "SELECT id FROM caches WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(SqliteCache {
      id,
      name: name.to_string(),
      conn: Arc::clone(&self.conn),
    })
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = lock(&self.conn)?;

    let found = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![name],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn names(&self) -> Result<Vec<String>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let conn = lock(&self.conn)?;
    let key = request.cache_key();

    let row = conn
      .query_row(
        &format!(
          "SELECT {ENTRY_COLUMNS} FROM cache_entries e
           INNER JOIN caches c ON c.id = e.cache_id
           WHERE e.url = ?
           ORDER BY c.id
           LIMIT 1"
        ),
        params![key],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(decode_entry).transpose()
  }
}

/// Handle to one named cache inside a [`SqliteStorage`].
pub struct SqliteCache {
  id: i64,
  name: String,
  conn: Arc<Mutex<Connection>>,
}

impl Cache for SqliteCache {
  fn name(&self) -> &str {
    &self.name
  }

  fn put_all(&self, entries: &[(Request, CachedResponse)]) -> Result<()> {
    let mut conn = lock(&self.conn)?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_id, url, response_url, status, status_text, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          self.id,
          request.cache_key(),
          response.url,
          response.status,
          response.status_text,
          headers,
          response.body,
          response.cached_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", request.url, e))?;
    }

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let conn = lock(&self.conn)?;
    let key = request.cache_key();

    let row = conn
      .query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM cache_entries e WHERE e.cache_id = ? AND e.url = ?"),
        params![self.id, key],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(decode_entry).transpose()
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_id = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![self.id], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

/// Entries of one named cache, in insertion order.
type MemoryEntries = Vec<(String, CachedResponse)>;

/// Storage that keeps every cache in process memory.
/// Used when persistence is disabled; contents are lost on exit.
#[derive(Clone, Default)]
pub struct MemoryStorage {
  caches: Arc<Mutex<Vec<(String, MemoryEntries)>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn lock_caches(
  caches: &Mutex<Vec<(String, MemoryEntries)>>,
) -> Result<MutexGuard<'_, Vec<(String, MemoryEntries)>>> {
  caches.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

impl CacheStorage for MemoryStorage {
  type Handle = MemoryCache;

  fn open(&self, name: &str) -> Result<MemoryCache> {
    let mut caches = lock_caches(&self.caches)?;
    if !caches.iter().any(|(n, _)| n == name) {
      caches.push((name.to_string(), Vec::new()));
    }

    Ok(MemoryCache {
      name: name.to_string(),
      caches: Arc::clone(&self.caches),
    })
  }

  fn has(&self, name: &str) -> Result<bool> {
    let caches = lock_caches(&self.caches)?;
    Ok(caches.iter().any(|(n, _)| n == name))
  }

  fn names(&self) -> Result<Vec<String>> {
    let caches = lock_caches(&self.caches)?;
    Ok(caches.iter().map(|(n, _)| n.clone()).collect())
  }

  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let key = request.cache_key();
    let caches = lock_caches(&self.caches)?;

    Ok(
      caches
        .iter()
        .flat_map(|(_, entries)| entries.iter())
        .find(|(k, _)| *k == key)
        .map(|(_, response)| response.clone()),
    )
  }
}

/// Handle to one named cache inside a [`MemoryStorage`].
pub struct MemoryCache {
  name: String,
  caches: Arc<Mutex<Vec<(String, MemoryEntries)>>>,
}

impl MemoryCache {
  fn with_entries<R>(&self, f: impl FnOnce(&mut MemoryEntries) -> R) -> Result<R> {
    let mut caches = lock_caches(&self.caches)?;
    let entries = caches
      .iter_mut()
      .find(|(n, _)| *n == self.name)
      .map(|(_, entries)| entries)
      .ok_or_else(|| eyre!("Cache {} no longer exists", self.name))?;
    Ok(f(entries))
  }
}

impl Cache for MemoryCache {
  fn name(&self) -> &str {
    &self.name
  }

  fn put_all(&self, new_entries: &[(Request, CachedResponse)]) -> Result<()> {
    self.with_entries(|entries| {
      for (request, response) in new_entries {
        let key = request.cache_key();
        entries.retain(|(k, _)| *k != key);
        entries.push((key, response.clone()));
      }
    })
  }

  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let key = request.cache_key();
    self.with_entries(|entries| {
      entries
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, response)| response.clone())
    })
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_entries(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
  }
}

/// Parse an RFC 3339 timestamp as stored in the entries table.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://example.com").unwrap().join(path).unwrap())
  }

  fn response(path: &str, body: &str) -> CachedResponse {
    CachedResponse {
      url: format!("https://example.com{}", path),
      status: 200,
      status_text: "OK".to_string(),
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.as_bytes().to_vec(),
      cached_at: Utc::now(),
    }
  }

  fn entries(paths: &[(&str, &str)]) -> Vec<(Request, CachedResponse)> {
    paths
      .iter()
      .map(|(path, body)| (request(path), response(path, body)))
      .collect()
  }

  fn exercise_storage<S: CacheStorage>(storage: S) {
    assert!(!storage.has("defect-system-v1").unwrap());

    let cache = storage.open("defect-system-v1").unwrap();
    assert!(storage.has("defect-system-v1").unwrap());
    assert_eq!(cache.name(), "defect-system-v1");
    assert!(cache.keys().unwrap().is_empty());

    cache
      .put_all(&entries(&[("/", "B0"), ("/index.html", "B1")]))
      .unwrap();

    let hit = cache.match_request(&request("/index.html")).unwrap().unwrap();
    assert_eq!(hit.body, b"B1");
    assert_eq!(hit.header("Content-Type"), Some("text/html"));
    assert!(cache.match_request(&request("/other.html")).unwrap().is_none());

    // Fragment is not part of the key
    let hit = storage.match_request(&request("/#section")).unwrap().unwrap();
    assert_eq!(hit.body, b"B0");

    // Non-GET never matches
    let post = request("/").with_method("POST");
    assert!(cache.match_request(&post).unwrap().is_none());
    assert!(storage.match_request(&post).unwrap().is_none());

    assert_eq!(
      cache.keys().unwrap(),
      vec!["https://example.com/", "https://example.com/index.html"]
    );
  }

  #[test]
  fn test_sqlite_storage_basic_operations() {
    exercise_storage(SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_memory_storage_basic_operations() {
    exercise_storage(MemoryStorage::new());
  }

  #[test]
  fn test_open_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = storage.open("v1").unwrap();
    first.put_all(&entries(&[("/", "B0")])).unwrap();

    let second = storage.open("v1").unwrap();
    assert_eq!(second.keys().unwrap(), vec!["https://example.com/"]);
    assert_eq!(storage.names().unwrap(), vec!["v1"]);
  }

  #[test]
  fn test_storage_match_prefers_oldest_cache() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let old = storage.open("defect-system-v1").unwrap();
    let new = storage.open("defect-system-v2").unwrap();

    new.put_all(&entries(&[("/", "new")])).unwrap();
    old.put_all(&entries(&[("/", "old")])).unwrap();
    new.put_all(&entries(&[("/index.html", "only-new")])).unwrap();

    assert_eq!(
      storage.names().unwrap(),
      vec!["defect-system-v1", "defect-system-v2"]
    );

    let hit = storage.match_request(&request("/")).unwrap().unwrap();
    assert_eq!(hit.body, b"old");

    let hit = storage.match_request(&request("/index.html")).unwrap().unwrap();
    assert_eq!(hit.body, b"only-new");
  }

  #[test]
  fn test_sqlite_storage_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      let cache = storage.open("defect-system-v1").unwrap();
      cache.put_all(&entries(&[("/manifest.json", "{}")])).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert!(storage.has("defect-system-v1").unwrap());
    let hit = storage
      .match_request(&request("/manifest.json"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.body, b"{}");
    assert_eq!(hit.status, 200);
    assert_eq!(hit.url, "https://example.com/manifest.json");
  }

  #[test]
  fn test_parse_datetime_roundtrips_rfc3339() {
    let now = Utc::now();
    let parsed = parse_datetime(&now.to_rfc3339()).unwrap();
    assert_eq!(parsed, now);
    assert!(parse_datetime("yesterday").is_err());
  }
}
