//! TTL-bound response caching.
//!
//! A [`ResponseCache`] is a registry of named [`ResponseRepository`] stores,
//! one per upstream resource type, sharing a single connect/close lifecycle.
//! Each repository derives a composite [`CacheKey`] from a request's method
//! and URL; requests whose derivation returns `None` are not cacheable and
//! silently bypass persistence. Expiry is lazy: entries past their TTL are
//! never returned, and stay on disk until [`ResponseRepository::clear`] runs.
//!
//! The SQLite reference backend lives in [`sqlite`] behind the default-on
//! `sqlite` feature; any backend implementing the two traits here plugs into
//! the request handler the same way.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use crate::{
    core::{
        error::CacheError,
        models::{RequestIdentity, ResponseRecord},
    },
    payload::{Payload, PayloadHandler, StringPayloadHandler},
};

/// TTL applied to repositories that do not override it.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One component of a composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// A textual component.
    Text(String),
    /// An integral component, e.g. a pagination offset.
    Int(i64),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Text(text) => f.write_str(text),
            KeyPart::Int(int) => write!(f, "{int}"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(text: &str) -> Self {
        KeyPart::Text(text.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(text: String) -> Self {
        KeyPart::Text(text)
    }
}

impl From<i64> for KeyPart {
    fn from(int: i64) -> Self {
        KeyPart::Int(int)
    }
}

impl From<u32> for KeyPart {
    fn from(int: u32) -> Self {
        KeyPart::Int(i64::from(int))
    }
}

/// A composite key identifying one cached response within a repository.
///
/// The parts line up positionally with the repository's key fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part: impl Into<KeyPart>) {
        self.0.push(part.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl From<Vec<KeyPart>> for CacheKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for CacheKey {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// The inputs a repository can resolve to a cache key.
///
/// Every repository method that looks an entry up accepts any of these and
/// funnels them through [`ResponseRepository::key_for`], so key derivation
/// has exactly one code path.
#[derive(Debug)]
pub enum KeySource<'a> {
    /// An already-derived key.
    Key(CacheKey),
    /// A request identity to derive the key from.
    Request(&'a RequestIdentity),
    /// A buffered exchange whose request identity derives the key.
    Record(&'a ResponseRecord),
}

impl From<CacheKey> for KeySource<'_> {
    fn from(key: CacheKey) -> Self {
        KeySource::Key(key)
    }
}

impl<'a> From<&'a RequestIdentity> for KeySource<'a> {
    fn from(identity: &'a RequestIdentity) -> Self {
        KeySource::Request(identity)
    }
}

impl<'a> From<&'a ResponseRecord> for KeySource<'a> {
    fn from(record: &'a ResponseRecord) -> Self {
        KeySource::Record(record)
    }
}

/// Derives a composite key from a request, or `None` when the request is not
/// cacheable by this repository.
pub type KeyFn = dyn Fn(&RequestIdentity) -> Option<CacheKey> + Send + Sync;

/// Derives an optional human-readable name for a stored payload.
pub type NameFn = dyn Fn(&Payload) -> Option<String> + Send + Sync;

/// Resolves the repository a URL belongs to, if any.
pub type RepositoryGetter =
    Arc<dyn Fn(&dyn ResponseCache, &Url) -> Option<Arc<dyn ResponseRepository>> + Send + Sync>;

/// Per-resource-type repository configuration.
#[derive(Clone)]
pub struct RepositorySettings {
    name: String,
    fields: Vec<String>,
    key_fn: Arc<KeyFn>,
    name_fn: Option<Arc<NameFn>>,
    payload_handler: Arc<dyn PayloadHandler>,
    expire: Option<Duration>,
}

impl RepositorySettings {
    /// Start building settings for a repository with this name.
    pub fn builder(name: impl Into<String>) -> RepositorySettingsBuilder {
        RepositorySettingsBuilder {
            name: name.into(),
            fields: Vec::new(),
            key_fn: None,
            name_fn: None,
            payload_handler: None,
            expire: None,
        }
    }

    /// The repository (and backing table) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered key field names.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The TTL override, when one was configured.
    pub fn expire(&self) -> Option<Duration> {
        self.expire
    }

    /// Derive the key for a request, `None` when it is not cacheable.
    pub fn key_for(&self, identity: &RequestIdentity) -> Option<CacheKey> {
        (self.key_fn)(identity)
    }

    /// Derive the display name for a payload, when a name fn is configured.
    pub fn display_name_for(&self, payload: &Payload) -> Option<String> {
        self.name_fn.as_ref().and_then(|name_fn| name_fn(payload))
    }

    pub(crate) fn initial_payload_handler(&self) -> Arc<dyn PayloadHandler> {
        self.payload_handler.clone()
    }
}

impl fmt::Debug for RepositorySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositorySettings")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("expire", &self.expire)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RepositorySettings`].
pub struct RepositorySettingsBuilder {
    name: String,
    fields: Vec<String>,
    key_fn: Option<Arc<KeyFn>>,
    name_fn: Option<Arc<NameFn>>,
    payload_handler: Option<Arc<dyn PayloadHandler>>,
    expire: Option<Duration>,
}

impl RepositorySettingsBuilder {
    /// Name the key's fields, in the order the key fn emits them.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// The key derivation: return `None` for requests this repository should
    /// not cache.
    pub fn key(mut self, key_fn: impl Fn(&RequestIdentity) -> Option<CacheKey> + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Derive a display name stored next to each entry.
    pub fn display_name(mut self, name_fn: impl Fn(&Payload) -> Option<String> + Send + Sync + 'static) -> Self {
        self.name_fn = Some(Arc::new(name_fn));
        self
    }

    /// The payload handler this repository starts with. Default: plain text.
    /// The request handler replaces it with its own on open.
    pub fn payload_handler(mut self, handler: impl PayloadHandler + 'static) -> Self {
        self.payload_handler = Some(Arc::new(handler));
        self
    }

    /// Override the cache-level TTL for this repository.
    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn build(self) -> Result<RepositorySettings, CacheError> {
        if self.fields.is_empty() {
            return Err(CacheError::Settings(format!(
                "repository {:?} declares no key fields",
                self.name
            )));
        }
        let Some(key_fn) = self.key_fn else {
            return Err(CacheError::Settings(format!(
                "repository {:?} has no key derivation",
                self.name
            )));
        };
        Ok(RepositorySettings {
            name: self.name,
            fields: self.fields,
            key_fn,
            name_fn: self.name_fn,
            payload_handler: self
                .payload_handler
                .unwrap_or_else(|| Arc::new(StringPayloadHandler)),
            expire: self.expire,
        })
    }
}

/// A TTL-bound key-value store for one upstream resource type.
#[async_trait]
pub trait ResponseRepository: Send + Sync + fmt::Debug {
    /// This repository's settings.
    fn settings(&self) -> &RepositorySettings;

    /// The effective TTL applied to new entries.
    fn expire(&self) -> Duration;

    /// The payload handler currently converting this repository's rows.
    fn payload_handler(&self) -> Arc<dyn PayloadHandler>;

    /// Replace the payload handler for all subsequent operations.
    fn set_payload_handler(&self, handler: Arc<dyn PayloadHandler>);

    /// The repository name.
    fn name(&self) -> &str {
        self.settings().name()
    }

    /// Normalize any lookup input to this repository's key.
    ///
    /// `None` means the input is not cacheable here.
    fn key_for(&self, source: &KeySource<'_>) -> Option<CacheKey> {
        match source {
            KeySource::Key(key) => Some(key.clone()),
            KeySource::Request(identity) => self.settings().key_for(identity),
            KeySource::Record(record) => self.settings().key_for(&record.identity),
        }
    }

    /// Provision the backing storage. Idempotent.
    async fn create(&self) -> Result<(), CacheError>;

    /// Number of stored entries.
    async fn count(&self, include_expired: bool) -> Result<u64, CacheError>;

    /// Whether an unexpired entry exists under this key.
    async fn contains(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Fetch and deserialize an unexpired entry, `None` on miss.
    async fn get_response(&self, source: KeySource<'_>) -> Result<Option<Payload>, CacheError>;

    /// Fetch the present, unexpired subset for a batch of sources.
    async fn get_responses(
        &self,
        sources: Vec<KeySource<'_>>,
    ) -> Result<Vec<Payload>, CacheError> {
        let mut payloads = Vec::new();
        for source in sources {
            if let Some(payload) = self.get_response(source).await? {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Persist one successful exchange.
    ///
    /// Succeeds without writing when the record's request is not cacheable
    /// here; a key whose arity does not match the declared fields is a hard
    /// error.
    async fn save_response(&self, record: &ResponseRecord) -> Result<(), CacheError>;

    /// Persist a batch of successful exchanges.
    async fn save_responses(&self, records: &[ResponseRecord]) -> Result<(), CacheError> {
        for record in records {
            self.save_response(record).await?;
        }
        Ok(())
    }

    /// Remove one entry. Returns whether a row was deleted.
    async fn delete_response(&self, source: KeySource<'_>) -> Result<bool, CacheError>;

    /// Remove a batch of entries, returning how many rows were deleted.
    async fn delete_responses(&self, sources: Vec<KeySource<'_>>) -> Result<u64, CacheError> {
        let mut deleted = 0;
        for source in sources {
            if self.delete_response(source).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove expired entries, or every entry when `expired_only` is false.
    /// Returns how many rows were deleted.
    async fn clear(&self, expired_only: bool) -> Result<u64, CacheError>;

    /// Render a payload with this repository's handler.
    async fn serialize(&self, payload: &Payload) -> Result<String, CacheError> {
        Ok(self.payload_handler().serialize(payload).await?)
    }

    /// Normalize raw input with this repository's handler.
    async fn deserialize(&self, raw: Payload) -> Result<Payload, CacheError> {
        Ok(self.payload_handler().deserialize(raw).await?)
    }
}

/// A registry of repositories sharing one backend lifecycle.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// The cache's name, e.g. the database it writes to.
    fn cache_name(&self) -> &str;

    /// Whether `connect()` has run and `close()` has not.
    fn is_connected(&self) -> bool;

    /// The TTL applied to repositories without their own override.
    fn expire(&self) -> Duration;

    /// Look a repository up by name.
    fn repository(&self, name: &str) -> Option<Arc<dyn ResponseRepository>>;

    /// Every registered repository.
    fn repositories(&self) -> Vec<Arc<dyn ResponseRepository>>;

    /// Resolve the repository responsible for a URL via the getter strategy.
    /// `None` when no getter is configured or none matches.
    fn repository_for_url(&self, url: &Url) -> Option<Arc<dyn ResponseRepository>>;

    /// Register a repository from settings.
    ///
    /// Registered before `connect()`, the repository is provisioned lazily
    /// when the cache connects; registered on a connected cache, it is
    /// provisioned immediately. Duplicate names are an error.
    async fn create_repository(
        &self,
        settings: RepositorySettings,
    ) -> Result<Arc<dyn ResponseRepository>, CacheError>;

    /// Open the shared backend and provision every registered repository.
    async fn connect(&self) -> Result<(), CacheError>;

    /// Close the shared backend. Repository use afterwards is an error.
    async fn close(&self) -> Result<(), CacheError>;

    /// Resolve the repository responsible for a request.
    fn repository_for_request(
        &self,
        identity: &RequestIdentity,
    ) -> Option<Arc<dyn ResponseRepository>> {
        self.repository_for_url(&identity.url)
    }

    /// Resolve the single repository a batch of requests belongs to.
    ///
    /// `None` when none match; an error when the batch spans more than one
    /// repository, since callers use this to pick one store for a whole
    /// batch.
    fn repository_for_requests(
        &self,
        identities: &[RequestIdentity],
    ) -> Result<Option<Arc<dyn ResponseRepository>>, CacheError> {
        let mut found: Option<Arc<dyn ResponseRepository>> = None;
        let mut names: Vec<String> = Vec::new();
        for identity in identities {
            if let Some(repository) = self.repository_for_request(identity)
                && !names.iter().any(|name| name == repository.name())
            {
                names.push(repository.name().to_string());
                found = Some(repository);
            }
        }
        if names.len() > 1 {
            return Err(CacheError::AmbiguousRepositories(names.join(", ")));
        }
        Ok(found)
    }

    /// Replace every repository's payload handler.
    fn set_payload_handler(&self, handler: Arc<dyn PayloadHandler>) {
        for repository in self.repositories() {
            repository.set_payload_handler(handler.clone());
        }
    }

    /// Persist a record into whichever repository claims its request.
    /// A record no repository claims is silently skipped.
    async fn save_response(&self, record: &ResponseRecord) -> Result<(), CacheError> {
        match self.repository_for_request(&record.identity) {
            Some(repository) => repository.save_response(record).await,
            None => Ok(()),
        }
    }

    /// Fetch the cached payload for a request, if its repository has one.
    async fn get_response(
        &self,
        identity: &RequestIdentity,
    ) -> Result<Option<Payload>, CacheError> {
        match self.repository_for_request(identity) {
            Some(repository) => repository.get_response(KeySource::Request(identity)).await,
            None => Ok(None),
        }
    }

    /// Remove the cached payload for a request. Returns whether a row was
    /// deleted.
    async fn delete_response(&self, identity: &RequestIdentity) -> Result<bool, CacheError> {
        match self.repository_for_request(identity) {
            Some(repository) => {
                repository
                    .delete_response(KeySource::Request(identity))
                    .await
            }
            None => Ok(false),
        }
    }
}
