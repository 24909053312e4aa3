use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Pure transform applied by [`DocumentStore::update_with_merge`].
pub type MergeFn<'a> = &'a (dyn Fn(Option<Value>) -> Result<Value> + Send + Sync);

/// Key-addressed JSON document storage.
///
/// This is the only persistence interface the core uses. Keys are
/// path-like strings (`users/{id}/jobs/index.json`). There is no
/// multi-writer transaction support: `update_with_merge` is a
/// read-transform-write performed while the implementation holds its
/// internal lock, which serializes concurrent writers on the same store
/// handle. Merge transforms should stay commutative (append a record,
/// update one entry) to keep last-writer-wins losses harmless.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    async fn update_with_merge(&self, key: &str, f: MergeFn<'_>) -> Result<Value>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    /// Issue a retrieval URL for a stored artifact, valid for `ttl_seconds`.
    async fn presigned_url(&self, key: &str, ttl_seconds: u64) -> Result<String>;
}

/// Typed read of a document; `None` when the key is absent.
pub async fn get_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed write of a document.
pub async fn put_doc<T: Serialize>(store: &dyn DocumentStore, key: &str, value: &T) -> Result<()> {
    store.put(key, serde_json::to_value(value)?).await
}

/// Typed read-transform-write. An absent document reads as `T::default()`.
pub async fn merge_doc<T, F>(store: &dyn DocumentStore, key: &str, transform: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
    F: Fn(T) -> T + Send + Sync,
{
    let merged = store
        .update_with_merge(key, &|current| {
            let current: T = match current {
                Some(v) => serde_json::from_value(v)?,
                None => T::default(),
            };
            Ok(serde_json::to_value(transform(current))?)
        })
        .await?;
    Ok(serde_json::from_value(merged)?)
}

/// Document keys, kept in one place so producers and consumers agree.
pub mod keys {
    pub const SCHEDULER_TASKS: &str = "scheduler/tasks.json";

    pub fn jobs_index(user_id: &str) -> String {
        format!("users/{user_id}/jobs/index.json")
    }

    pub fn applications_index(user_id: &str) -> String {
        format!("users/{user_id}/applications/index.json")
    }

    pub fn settings(user_id: &str) -> String {
        format!("users/{user_id}/settings.json")
    }

    pub fn profile(user_id: &str) -> String {
        format!("users/{user_id}/profile.json")
    }

    pub fn inbox(user_id: &str) -> String {
        format!("users/{user_id}/notifications/inbox.json")
    }

    pub fn screenshot(user_id: &str, application_id: &uuid::Uuid) -> String {
        format!("users/{user_id}/screenshots/{application_id}.json")
    }
}

/// Local document store backed by a single-table sqlite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open() -> Result<Self> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::internal)?;
        }
        let conn = Connection::open(&path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> PathBuf {
        // XDG data directory or fallback to the working directory
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "autohunt") {
            proj_dirs.data_dir().join("autohunt.db")
        } else {
            PathBuf::from("autohunt.db")
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    fn read(conn: &Connection, key: &str) -> Result<Option<Value>> {
        let row: Option<String> = match conn.query_row(
            "SELECT value FROM documents WHERE key = ?1",
            [key],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        match row {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write(conn: &Connection, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            rusqlite::params![key, text],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        Self::read(&conn, key)
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::write(&conn, key, &value)
    }

    async fn update_with_merge(&self, key: &str, f: MergeFn<'_>) -> Result<Value> {
        // Lock held across read and write: writers on this handle serialize.
        let conn = self.conn.lock().await;
        let current = Self::read(&conn, key)?;
        let next = f(current)?;
        Self::write(&conn, key, &next)?;
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM documents WHERE key = ?1", [key])?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // Escape LIKE metacharacters; keys routinely contain underscores.
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{escaped}%");
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT key FROM documents WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn presigned_url(&self, key: &str, ttl_seconds: u64) -> Result<String> {
        if self.get(key).await?.is_none() {
            return Err(Error::not_found(format!("document {key}")));
        }
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        Ok(format!("store://{key}?expires={expires}"))
    }
}

/// In-memory document store for tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.docs.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn update_with_merge(&self, key: &str, f: MergeFn<'_>) -> Result<Value> {
        let mut docs = self.docs.lock().await;
        let next = f(docs.get(key).cloned())?;
        docs.insert(key.to_string(), next.clone());
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.docs.lock().await.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .docs
            .lock()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn presigned_url(&self, key: &str, ttl_seconds: u64) -> Result<String> {
        if !self.docs.lock().await.contains_key(key) {
            return Err(Error::not_found(format!("document {key}")));
        }
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        Ok(format!("memory://{key}?expires={expires}"))
    }
}
