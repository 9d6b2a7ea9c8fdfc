//! TTL request cache over pluggable storage backends.
//!
//! [`RequestCache`] stores JSON envelopes of the form
//! `{ value, is_error, timestamp, ttl }` through a [`CacheBackend`]. Expiry is
//! lazy: an expired entry is discovered by the read that finds it, deleted,
//! and reported as a miss. Nothing sweeps the backend proactively.
//!
//! Two backends ship with the crate: [`MemoryBackend`] for page-session
//! caching and tests, and [`FileBackend`] for persistence across runs. Time
//! is injected through the [`Clock`] trait so expiry is testable without
//! sleeping.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source of unix-epoch seconds.
///
/// Production code uses [`SystemClock`]; tests inject a manual clock and
/// advance it explicitly.
pub trait Clock: Send + Sync + 'static {
    /// Seconds since the unix epoch.
    fn now(&self) -> u64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::UNIX_EPOCH
            .elapsed()
            .expect("system clock is before Unix epoch")
            .as_secs()
    }
}

/// Raw key/value storage underneath the request cache.
///
/// Signatures are infallible by contract: backends handle their own I/O
/// failures (logging them) and degrade to misses, because a broken cache must
/// never break a read path.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Stored value for `key`, if any.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value);

    /// Remove `key` if present.
    async fn delete(&self, key: &str);

    /// All stored keys, sorted.
    async fn keys(&self) -> Vec<String>;
}

/// Process-local backend: a locked map, no persistence.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .expect("entries mutex poisoned")
            .get(key)
            .cloned()
    }

    async fn set(&self, key: &str, value: Value) {
        self.entries
            .lock()
            .expect("entries mutex poisoned")
            .insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.entries
            .lock()
            .expect("entries mutex poisoned")
            .remove(key);
    }

    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .expect("entries mutex poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Persistent backend: one file per key under a base directory.
///
/// Writes go to a temporary file first and are renamed into place, so a crash
/// mid-write never leaves a half-written entry. Unreadable or corrupt files
/// are logged and treated as absent. Because the original key survives inside
/// each file, sanitized file names only need to be collision-resistant, not
/// reversible.
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_dir: PathBuf,
}

/// On-disk wrapper carrying the original key next to the stored value.
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: Value,
}

impl FileBackend {
    /// Backend rooted at `base_dir`; the directory is created on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this backend.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", file_stem(key)))
    }

    fn read_record(path: &Path) -> Option<FileRecord> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache file");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache file");
                None
            }
        }
    }
}

/// File name stem for `key`: a readable sanitized prefix plus a hash suffix
/// so distinct keys never share a file.
fn file_stem(key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let digest = hasher.finish();
    let safe: String = key
        .chars()
        .take(40)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}-{digest:016x}")
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, key: &str) -> Option<Value> {
        let path = self.entry_path(key);
        let record = Self::read_record(&path)?;
        // Guard against a (vanishingly unlikely) file-stem collision.
        (record.key == key).then_some(record.value)
    }

    async fn set(&self, key: &str, value: Value) {
        let record = FileRecord {
            key: key.to_string(),
            value,
        };
        let path = self.entry_path(key);
        let tmp_path = path.with_extension("json.tmp");
        let result = (|| -> io::Result<()> {
            fs::create_dir_all(&self.base_dir)?;
            let json = serde_json::to_string(&record).map_err(io::Error::other)?;
            fs::write(&tmp_path, json)?;
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "cache write failed");
        }
    }

    async fn delete(&self, key: &str) {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache delete failed");
            }
        }
    }

    async fn keys(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.base_dir.display(), error = %e, "cache listing failed");
                return Vec::new();
            }
        };
        let mut keys: Vec<String> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    return None;
                }
                Self::read_record(&path).map(|record| record.key)
            })
            .collect();
        keys.sort();
        keys
    }
}

/// Envelope persisted for every cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    is_error: bool,
    /// Unix seconds at write time.
    timestamp: u64,
    /// Lifetime in seconds.
    ttl: u64,
}

/// Options for [`RequestCache::set_item`].
#[derive(Debug, Clone, Copy)]
pub struct CacheItemOptions {
    /// Entry lifetime.
    pub ttl: Duration,
    /// Mark the entry as a stored error response.
    pub is_error: bool,
}

impl Default for CacheItemOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            is_error: false,
        }
    }
}

impl CacheItemOptions {
    /// Successful-response entry with a custom lifetime.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Error-response entry with a custom lifetime.
    pub fn error(ttl: Duration) -> Self {
        Self { ttl, is_error: true }
    }
}

/// A non-expired cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Value,
    /// Whether the stored response was an error.
    pub is_error: bool,
    /// Time left before the entry expires (zero at the expiry boundary).
    pub ttl_remaining: Duration,
}

/// TTL cache shared by every store through the REST client.
///
/// Cheap to clone; clones share the backend and clock.
#[derive(Clone)]
pub struct RequestCache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl RequestCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Memory-backed cache on the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
    }

    /// Read `key`, treating expired and undecodable entries as misses.
    ///
    /// Both are evicted on discovery; an entry is expired once
    /// `now - timestamp > ttl`, so a read exactly at the boundary still hits
    /// with zero remaining lifetime.
    pub async fn get_item(&self, key: &str) -> Option<CacheHit> {
        let raw = self.backend.get(key).await?;
        let entry: CacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cache entry, evicting");
                self.backend.delete(key).await;
                return None;
            }
        };
        let age = self.clock.now().saturating_sub(entry.timestamp);
        if age > entry.ttl {
            self.backend.delete(key).await;
            return None;
        }
        Some(CacheHit {
            value: entry.value,
            is_error: entry.is_error,
            ttl_remaining: Duration::from_secs(entry.ttl - age),
        })
    }

    /// Store `value` under `key` with the options' lifetime.
    pub async fn set_item(&self, key: &str, value: Value, options: CacheItemOptions) {
        let entry = CacheEntry {
            value,
            is_error: options.is_error,
            timestamp: self.clock.now(),
            ttl: options.ttl.as_secs(),
        };
        let raw = serde_json::to_value(&entry).expect("cache entry serialization is infallible");
        self.backend.set(key, raw).await;
    }

    /// Remove `key` if present.
    pub async fn delete_item(&self, key: &str) {
        self.backend.delete(key).await;
    }

    /// Remove every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        for key in self.backend.keys().await {
            if key.starts_with(prefix) {
                self.backend.delete(&key).await;
            }
        }
    }

    /// All stored keys, sorted (including expired entries not yet evicted).
    pub async fn keys(&self) -> Vec<String> {
        self.backend.keys().await
    }
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache").finish_non_exhaustive()
    }
}
