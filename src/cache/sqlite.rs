//! SQLite reference backend for the response cache.
//!
//! One table per repository: the key fields form a composite primary key,
//! followed by a nullable display `name`, RFC 3339 `cached_at` / `expiry`
//! timestamps, and the serialized `payload`. Every repository shares the
//! cache's single connection; blocking SQLite work runs on the tokio
//! blocking pool.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params_from_iter, types::Value as SqlValue};
use tracing::debug;
use url::Url;

use crate::{
    cache::{
        CacheKey, DEFAULT_EXPIRE, KeySource, RepositoryGetter, RepositorySettings, ResponseCache,
        ResponseRepository,
    },
    core::{error::CacheError, models::ResponseRecord},
    payload::{Payload, PayloadHandler},
};

type Connector = dyn Fn() -> Result<Connection, CacheError> + Send + Sync;

/// The shared connection slot. `None` until `connect()`, `None` again after
/// `close()`; repositories fail with [`CacheError::Disconnected`] either way.
struct Backend {
    connection: RwLock<Option<Arc<Mutex<Connection>>>>,
}

impl Backend {
    fn handle(&self) -> Result<Arc<Mutex<Connection>>, CacheError> {
        self.connection
            .read()
            .clone()
            .ok_or(CacheError::Disconnected)
    }
}

/// SQLite-backed [`ResponseCache`].
pub struct SqliteCache {
    cache_name: String,
    connector: Box<Connector>,
    expire: Duration,
    repository_getter: RwLock<Option<RepositoryGetter>>,
    repositories: RwLock<Vec<Arc<SqliteRepository>>>,
    backend: Arc<Backend>,
}

impl SqliteCache {
    /// A cache opening its connection through a custom connector.
    pub fn new(
        cache_name: impl Into<String>,
        connector: impl Fn() -> Result<Connection, CacheError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            connector: Box::new(connector),
            expire: DEFAULT_EXPIRE,
            repository_getter: RwLock::new(None),
            repositories: RwLock::new(Vec::new()),
            backend: Arc::new(Backend {
                connection: RwLock::new(None),
            }),
        }
    }

    /// A cache stored in a database file, created on first connect.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self::new(name, move || Connection::open(&path).map_err(db_err))
    }

    /// A cache held entirely in memory. Closing it discards every entry.
    pub fn in_memory() -> Self {
        Self::new(":memory:", || Connection::open_in_memory().map_err(db_err))
    }

    /// A cache stored in a database file under the system temp directory.
    /// `name` stays the cache name; only the file path is derived from it.
    pub fn with_temp_db(name: impl Into<String>) -> Self {
        let name = name.into();
        let path = std::env::temp_dir().join(format!("{name}.sqlite"));
        Self::new(name, move || Connection::open(&path).map_err(db_err))
    }

    /// Set the TTL applied to repositories that do not override it.
    /// Default: one week.
    pub fn expire_after(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    /// Set the strategy resolving which repository a URL belongs to.
    pub fn repository_getter(self, getter: RepositoryGetter) -> Self {
        *self.repository_getter.write() = Some(getter);
        self
    }
}

#[async_trait]
impl ResponseCache for SqliteCache {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn is_connected(&self) -> bool {
        self.backend.connection.read().is_some()
    }

    fn expire(&self) -> Duration {
        self.expire
    }

    fn repository(&self, name: &str) -> Option<Arc<dyn ResponseRepository>> {
        self.repositories
            .read()
            .iter()
            .find(|repository| repository.name() == name)
            .cloned()
            .map(|repository| repository as Arc<dyn ResponseRepository>)
    }

    fn repositories(&self) -> Vec<Arc<dyn ResponseRepository>> {
        self.repositories
            .read()
            .iter()
            .cloned()
            .map(|repository| repository as Arc<dyn ResponseRepository>)
            .collect()
    }

    fn repository_for_url(&self, url: &Url) -> Option<Arc<dyn ResponseRepository>> {
        let getter = self.repository_getter.read().clone()?;
        getter(self, url)
    }

    async fn create_repository(
        &self,
        settings: RepositorySettings,
    ) -> Result<Arc<dyn ResponseRepository>, CacheError> {
        let expire = settings.expire().unwrap_or(self.expire);
        let repository = Arc::new(SqliteRepository::new(settings, expire, self.backend.clone()));
        {
            let mut repositories = self.repositories.write();
            if repositories
                .iter()
                .any(|existing| existing.name() == repository.name())
            {
                return Err(CacheError::DuplicateRepository(
                    repository.name().to_string(),
                ));
            }
            repositories.push(repository.clone());
        }
        if self.is_connected() {
            repository.create().await?;
        }
        Ok(repository)
    }

    async fn connect(&self) -> Result<(), CacheError> {
        if !self.is_connected() {
            let connection = (self.connector)()?;
            *self.backend.connection.write() = Some(Arc::new(Mutex::new(connection)));
        }
        let repositories: Vec<Arc<SqliteRepository>> = self.repositories.read().clone();
        for repository in repositories {
            repository.create().await?;
        }
        debug!(cache = %self.cache_name, "cache connected");
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        // In-flight operations hold their own handle clone and finish on it;
        // the connection closes when the last clone drops.
        if self.backend.connection.write().take().is_some() {
            debug!(cache = %self.cache_name, "cache closed");
        }
        Ok(())
    }
}

/// SQLite-backed [`ResponseRepository`]: one table, keyed by the settings'
/// fields.
pub struct SqliteRepository {
    settings: RepositorySettings,
    expire: Duration,
    payload_handler: RwLock<Arc<dyn PayloadHandler>>,
    backend: Arc<Backend>,
}

impl fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("settings", &self.settings)
            .field("expire", &self.expire)
            .finish_non_exhaustive()
    }
}

impl SqliteRepository {
    fn new(settings: RepositorySettings, expire: Duration, backend: Arc<Backend>) -> Self {
        let payload_handler = RwLock::new(settings.initial_payload_handler());
        Self {
            settings,
            expire,
            payload_handler,
            backend,
        }
    }

    fn table(&self) -> String {
        quote_ident(self.settings.name())
    }

    /// `"field_a" = ? AND "field_b" = ?` over the declared key fields.
    fn key_predicate(&self) -> String {
        self.settings
            .fields()
            .iter()
            .map(|field| format!("{} = ?", quote_ident(field)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Normalized key with its arity checked against the declared fields.
    fn checked_key(&self, source: &KeySource<'_>) -> Result<Option<CacheKey>, CacheError> {
        match self.key_for(source) {
            None => Ok(None),
            Some(key) if key.len() == self.settings.fields().len() => Ok(Some(key)),
            Some(key) => Err(CacheError::KeyArity {
                expected: self.settings.fields().len(),
                got: key.len(),
            }),
        }
    }
}

#[async_trait]
impl ResponseRepository for SqliteRepository {
    fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    fn expire(&self) -> Duration {
        self.expire
    }

    fn payload_handler(&self) -> Arc<dyn PayloadHandler> {
        self.payload_handler.read().clone()
    }

    fn set_payload_handler(&self, handler: Arc<dyn PayloadHandler>) {
        *self.payload_handler.write() = handler;
    }

    async fn create(&self) -> Result<(), CacheError> {
        let conn = self.backend.handle()?;
        let columns = self
            .settings
            .fields()
            .iter()
            .map(|field| format!("{} TEXT NOT NULL", quote_ident(field)))
            .collect::<Vec<_>>()
            .join(", ");
        let primary_key = self
            .settings
            .fields()
            .iter()
            .map(|field| quote_ident(field))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns}, name TEXT, cached_at TEXT NOT NULL, \
             expiry TEXT NOT NULL, payload TEXT NOT NULL, PRIMARY KEY ({primary_key}))",
            self.table()
        );
        blocking(move || {
            conn.lock().execute(&sql, []).map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn count(&self, include_expired: bool) -> Result<u64, CacheError> {
        let conn = self.backend.handle()?;
        let (sql, params) = if include_expired {
            (format!("SELECT COUNT(*) FROM {}", self.table()), Vec::new())
        } else {
            (
                format!("SELECT COUNT(*) FROM {} WHERE expiry > ?", self.table()),
                vec![SqlValue::Text(now_iso())],
            )
        };
        blocking(move || {
            let conn = conn.lock();
            let count: i64 = conn
                .query_row(&sql, params_from_iter(params), |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as u64)
        })
        .await
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let conn = self.backend.handle()?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} AND expiry > ?)",
            self.table(),
            self.key_predicate()
        );
        let mut params = key_values(key);
        params.push(SqlValue::Text(now_iso()));
        blocking(move || {
            let conn = conn.lock();
            let present: i64 = conn
                .query_row(&sql, params_from_iter(params), |row| row.get(0))
                .map_err(db_err)?;
            Ok(present != 0)
        })
        .await
    }

    async fn get_response(&self, source: KeySource<'_>) -> Result<Option<Payload>, CacheError> {
        let Some(key) = self.checked_key(&source)? else {
            return Ok(None);
        };
        let conn = self.backend.handle()?;
        let sql = format!(
            "SELECT payload FROM {} WHERE {} AND expiry > ?",
            self.table(),
            self.key_predicate()
        );
        let mut params = key_values(&key);
        params.push(SqlValue::Text(now_iso()));
        let stored: Option<String> = blocking(move || {
            let conn = conn.lock();
            conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
                .optional()
                .map_err(db_err)
        })
        .await?;
        match stored {
            Some(text) => Ok(Some(self.deserialize(Payload::Text(text)).await?)),
            None => Ok(None),
        }
    }

    async fn save_response(&self, record: &ResponseRecord) -> Result<(), CacheError> {
        let Some(key) = self.checked_key(&KeySource::Record(record))? else {
            debug!(
                repository = self.name(),
                url = %record.identity.url,
                "request is not cacheable; skipping save"
            );
            return Ok(());
        };
        // Normalize through the payload handler so stored rows always hold
        // the handler's serialized form, whatever the wire body looked like.
        let payload = self.deserialize(Payload::Text(record.body.clone())).await?;
        let display_name = self.settings.display_name_for(&payload);
        let serialized = self.serialize(&payload).await?;

        let conn = self.backend.handle()?;
        let now = Utc::now();
        let expiry = now
            + chrono::Duration::from_std(self.expire)
                .map_err(|e| CacheError::Backend(e.to_string()))?;
        let field_list = self
            .settings
            .fields()
            .iter()
            .map(|field| quote_ident(field))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; self.settings.fields().len() + 4].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({field_list}, name, cached_at, expiry, payload) \
             VALUES ({placeholders})",
            self.table()
        );
        let mut params = key_values(&key);
        params.push(display_name.map_or(SqlValue::Null, SqlValue::Text));
        params.push(SqlValue::Text(iso(now)));
        params.push(SqlValue::Text(iso(expiry)));
        params.push(SqlValue::Text(serialized));
        blocking(move || {
            conn.lock()
                .execute(&sql, params_from_iter(params))
                .map_err(db_err)?;
            Ok(())
        })
        .await?;
        debug!(repository = self.name(), key = %key, "cached response");
        Ok(())
    }

    async fn delete_response(&self, source: KeySource<'_>) -> Result<bool, CacheError> {
        let Some(key) = self.checked_key(&source)? else {
            return Ok(false);
        };
        let conn = self.backend.handle()?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.table(),
            self.key_predicate()
        );
        let params = key_values(&key);
        blocking(move || {
            let deleted = conn
                .lock()
                .execute(&sql, params_from_iter(params))
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn clear(&self, expired_only: bool) -> Result<u64, CacheError> {
        let conn = self.backend.handle()?;
        let (sql, params) = if expired_only {
            (
                format!("DELETE FROM {} WHERE expiry <= ?", self.table()),
                vec![SqlValue::Text(now_iso())],
            )
        } else {
            (format!("DELETE FROM {}", self.table()), Vec::new())
        };
        blocking(move || {
            let deleted = conn
                .lock()
                .execute(&sql, params_from_iter(params))
                .map_err(db_err)?;
            Ok(deleted as u64)
        })
        .await
    }
}

async fn blocking<T: Send + 'static>(
    task: impl FnOnce() -> Result<T, CacheError> + Send + 'static,
) -> Result<T, CacheError> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CacheError::Backend(e.to_string()))?
}

fn db_err(e: rusqlite::Error) -> CacheError {
    CacheError::Backend(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Key parts bind as text so lookups compare exactly what writes stored.
fn key_values(key: &CacheKey) -> Vec<SqlValue> {
    key.parts()
        .iter()
        .map(|part| SqlValue::Text(part.to_string()))
        .collect()
}

fn iso(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The current instant in the fixed-width form timestamps are stored in, so
/// SQLite's text comparison orders them chronologically.
fn now_iso() -> String {
    iso(Utc::now())
}
