//! Memoized collection results.
//!
//! A [`ResultCache`] maps a content-derived [`CacheKey`] to a serialized
//! [`CollectionResult`]. Entries expire after a TTL and the cumulative payload
//! size is held under a ceiling by evicting the oldest-created entries first.
//! All operations serialize on one lock.
//!
//! The on-disk mirror is a single JSON document written atomically (temp file
//! then rename). A missing or corrupt file loads as an empty cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ctxpack_config::CacheConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::assembler::{Budget, InjectionPolicy};
use crate::result::CollectionResult;

/// Version of the key derivation and of the on-disk layout.
const FORMAT_VERSION: u32 = 1;

/// Errors from writing the on-disk mirror.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to write cache file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cache: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Facts about the host and engine that change what a collection returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFingerprint {
    pub engine_version: String,
    pub external_search: bool,
    /// Digest of the settings that shape results (weights, limits, ratios).
    pub settings_digest: String,
}

impl CapabilityFingerprint {
    pub fn new(external_search: bool, settings_digest: impl Into<String>) -> Self {
        Self {
            engine_version: crate::build_info::VERSION.to_string(),
            external_search,
            settings_digest: settings_digest.into(),
        }
    }
}

/// Hex SHA-256 digest of `bytes`.
pub fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Stable identifier of one (query, options, root, capabilities) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        root: &Path,
        normalized_query: &str,
        budget: &Budget,
        policy: InjectionPolicy,
        fingerprint: &CapabilityFingerprint,
    ) -> Self {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        };
        field(&format!("v{FORMAT_VERSION}"));
        field(&root.to_string_lossy());
        field(normalized_query);
        field(&budget.max_tokens.to_string());
        field(&format!("{:?}", budget.max_files));
        field(&format!("{:?}", budget.max_total_bytes));
        field(policy.as_str());
        field(&fingerprint.engine_version);
        field(if fingerprint.external_search { "rg" } else { "scan" });
        field(&fingerprint.settings_digest);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    /// Serialized `CollectionResult`.
    payload: String,
    created_at_ms: u64,
    /// Insertion order, breaks ties between entries created in the same millisecond.
    seq: u64,
    ttl_ms: u64,
    hits: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<CacheKey, CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    total_bytes: usize,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn purge_expired(&mut self, now_ms: u64) {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    /// Evict oldest-created entries until `incoming` more bytes fit under `ceiling`.
    fn make_room(&mut self, incoming: usize, ceiling: usize) {
        while self.total_bytes + incoming > ceiling {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.created_at_ms, e.seq))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.remove(&oldest);
            self.evictions += 1;
            debug!(key = %oldest, "Evicted cache entry");
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Size-bounded, TTL-aware result cache. Safe to share between threads.
#[derive(Debug)]
pub struct ResultCache {
    state: Mutex<CacheState>,
    /// Serializes writers of the on-disk mirror, which share one temp file.
    write_lock: Mutex<()>,
    max_bytes: usize,
    default_ttl: Duration,
    path: Option<PathBuf>,
}

impl ResultCache {
    /// An in-memory cache.
    pub fn new(max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            write_lock: Mutex::new(()),
            max_bytes,
            default_ttl,
            path: None,
        }
    }

    /// A cache mirrored to `path`, pre-loaded from it when readable.
    pub fn open(path: impl Into<PathBuf>, max_bytes: usize, default_ttl: Duration) -> Self {
        let path = path.into();
        let mut state = CacheState::default();
        if let Some(file) = load_file(&path) {
            let now = now_ms();
            let mut loaded: Vec<(CacheKey, CacheEntry)> = file
                .entries
                .into_iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .filter(|(key, entry)| {
                    let decodes = serde_json::from_str::<CollectionResult>(&entry.payload).is_ok();
                    if !decodes {
                        warn!(key = %key, "Dropping undecodable cache entry");
                    }
                    decodes
                })
                .collect();
            loaded.sort_by(|(a_key, a), (b_key, b)| {
                (a.created_at_ms, a.seq, a_key.as_str()).cmp(&(b.created_at_ms, b.seq, b_key.as_str()))
            });
            // Stored sizes and sequence numbers are not trusted; both are rebuilt.
            for (key, mut entry) in loaded {
                entry.created_at_ms = entry.created_at_ms.min(now);
                entry.seq = state.next_seq;
                entry.size_bytes = entry.payload.len() + key.as_str().len();
                state.next_seq += 1;
                state.total_bytes += entry.size_bytes;
                state.entries.insert(key, entry);
            }
            // The ceiling may have shrunk since the file was written.
            state.make_room(0, max_bytes);
            info!(path = %path.display(), entries = state.entries.len(), "Loaded result cache");
        }
        Self {
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
            max_bytes,
            default_ttl,
            path: Some(path),
        }
    }

    /// Build from configuration, mirroring to disk when persistence is on.
    pub fn from_config(config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs);
        match config.resolved_path() {
            Some(path) => Self::open(path, config.max_bytes, ttl),
            None => Self::new(config.max_bytes, ttl),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The stored result for `key`, flagged as cached, unless absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<CollectionResult> {
        let mut state = self.lock();
        let now = now_ms();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.remove(key);
            state.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        let decoded = state
            .entries
            .get(key)
            .map(|e| serde_json::from_str::<CollectionResult>(&e.payload));
        match decoded {
            Some(Ok(mut result)) => {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.hits += 1;
                }
                state.hits += 1;
                result.metadata.cached = true;
                Some(result)
            }
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                state.remove(key);
                state.misses += 1;
                None
            }
            None => None,
        }
    }

    /// Store `result` under `key`, evicting the oldest entries if needed.
    ///
    /// Returns `false` when the entry alone exceeds the ceiling or cannot be
    /// serialized.
    pub fn set(&self, key: CacheKey, result: &CollectionResult, ttl: Option<Duration>) -> bool {
        let mut stored = result.clone();
        stored.metadata.cached = false;
        let payload = match serde_json::to_string(&stored) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize result");
                return false;
            }
        };
        let size_bytes = payload.len() + key.as_str().len();
        if size_bytes > self.max_bytes {
            warn!(
                key = %key,
                size_bytes,
                max_bytes = self.max_bytes,
                "Result larger than cache ceiling, not stored"
            );
            return false;
        }

        let mut state = self.lock();
        let now = now_ms();
        state.remove(&key);
        state.purge_expired(now);
        state.make_room(size_bytes, self.max_bytes);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += size_bytes;
        let ttl_ms = u64::try_from(ttl.unwrap_or(self.default_ttl).as_millis()).unwrap_or(u64::MAX);
        state.entries.insert(
            key,
            CacheEntry {
                payload,
                created_at_ms: now,
                seq,
                ttl_ms,
                hits: 0,
                size_bytes,
            },
        );
        true
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            max_bytes: self.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Write live entries to the on-disk mirror. A no-op for in-memory caches.
    pub fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let json = {
            let mut state = self.lock();
            state.purge_expired(now_ms());
            serde_json::to_vec(&CacheFileRef {
                version: FORMAT_VERSION,
                entries: &state.entries,
            })?
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Persisted result cache");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    entries: &'a HashMap<CacheKey, CacheEntry>,
}

fn load_file(path: &Path) -> Option<CacheFile> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable cache file, starting empty");
            return None;
        }
    };
    match serde_json::from_slice::<CacheFile>(&bytes) {
        Ok(file) if file.version == FORMAT_VERSION => Some(file),
        Ok(file) => {
            info!(path = %path.display(), version = file.version, "Ignoring cache file from another version");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt cache file, starting empty");
            None
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relevance::ScoreBreakdown;
    use crate::result::{CollectedFile, CollectionMetadata};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn result(query: &str, body: &str) -> CollectionResult {
        CollectionResult {
            query: query.to_string(),
            files: vec![CollectedFile {
                path: "README.md".to_string(),
                content: body.to_string(),
                priority: 120,
                score: ScoreBreakdown {
                    canonical: 100,
                    extension: 20,
                    ..ScoreBreakdown::default()
                },
                tokens: 3,
                truncated: false,
                policy: InjectionPolicy::Full,
            }],
            metadata: CollectionMetadata {
                files_scanned: 1,
                excluded_count: 0,
                total_tokens: 3,
                max_tokens: 100,
                elapsed_ms: 4,
                external_search_used: false,
                cached: false,
                keywords: vec![],
            },
        }
    }

    fn key(query: &str) -> CacheKey {
        CacheKey::compute(
            Path::new("/project"),
            query,
            &Budget::tokens(100),
            InjectionPolicy::Full,
            &CapabilityFingerprint::new(false, "settings"),
        )
    }

    #[test]
    fn test_key_is_stable_and_sensitive() {
        let fp = CapabilityFingerprint::new(true, "s");
        let base = CacheKey::compute(Path::new("/p"), "auth", &Budget::tokens(100), InjectionPolicy::Full, &fp);
        let again = CacheKey::compute(Path::new("/p"), "auth", &Budget::tokens(100), InjectionPolicy::Full, &fp);
        assert_eq!(base, again);
        assert_eq!(base.as_str().len(), 64);

        let variants = [
            CacheKey::compute(Path::new("/q"), "auth", &Budget::tokens(100), InjectionPolicy::Full, &fp),
            CacheKey::compute(Path::new("/p"), "login", &Budget::tokens(100), InjectionPolicy::Full, &fp),
            CacheKey::compute(Path::new("/p"), "auth", &Budget::tokens(200), InjectionPolicy::Full, &fp),
            CacheKey::compute(Path::new("/p"), "auth", &Budget::tokens(100), InjectionPolicy::Minimal, &fp),
            CacheKey::compute(
                Path::new("/p"),
                "auth",
                &Budget::tokens(100),
                InjectionPolicy::Full,
                &CapabilityFingerprint::new(false, "s"),
            ),
            CacheKey::compute(
                Path::new("/p"),
                "auth",
                &Budget {
                    max_files: Some(1),
                    ..Budget::tokens(100)
                },
                InjectionPolicy::Full,
                &fp,
            ),
        ];
        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn test_hit_is_flagged_and_counted() {
        let cache = ResultCache::new(1 << 20, HOUR);
        let original = result("q", "hello");
        assert!(cache.set(key("q"), &original, None));

        let hit = cache.get(&key("q")).unwrap();
        assert!(hit.metadata.cached);
        assert_eq!(hit.files, original.files);

        cache.get(&key("q")).unwrap();
        assert!(cache.get(&key("other")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_zero_ttl_is_a_miss() {
        let cache = ResultCache::new(1 << 20, HOUR);
        cache.set(key("q"), &result("q", "x"), Some(Duration::ZERO));
        assert!(cache.get(&key("q")).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = ResultCache::new(1 << 20, HOUR);
        cache.set(key("q"), &result("q", "x"), Some(Duration::from_millis(20)));
        assert!(cache.get(&key("q")).is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&key("q")).is_none());
    }

    #[test]
    fn test_eviction_keeps_size_under_ceiling_oldest_first() {
        let one = result("q", &"x".repeat(200));
        let size = serde_json::to_string(&one).unwrap().len() + 64;
        let cache = ResultCache::new(size * 5 / 2, HOUR);

        for name in ["k1", "k2", "k3", "k4"] {
            assert!(cache.set(key(name), &one, None));
            let stats = cache.stats();
            assert!(stats.bytes <= stats.max_bytes);
        }

        assert!(cache.get(&key("k1")).is_none());
        assert!(cache.get(&key("k2")).is_none());
        assert!(cache.get(&key("k3")).is_some());
        assert!(cache.get(&key("k4")).is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_oversized_entry_is_not_stored() {
        let cache = ResultCache::new(64, HOUR);
        assert!(!cache.set(key("q"), &result("q", &"x".repeat(500)), None));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_replacing_a_key_does_not_double_count() {
        let cache = ResultCache::new(1 << 20, HOUR);
        cache.set(key("q"), &result("q", "first"), None);
        let before = cache.stats().bytes;
        cache.set(key("q"), &result("q", "later"), None);

        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, before);
        assert_eq!(cache.get(&key("q")).unwrap().files[0].content, "later");
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResultCache::new(1 << 20, HOUR);
        cache.set(key("a"), &result("a", "x"), None);
        cache.set(key("b"), &result("b", "y"), None);

        assert!(cache.invalidate(&key("a")));
        assert!(!cache.invalidate(&key("a")));
        assert!(cache.get(&key("a")).is_none());

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[test]
    fn test_persist_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("cache.json");

        let cache = ResultCache::open(&path, 1 << 20, HOUR);
        cache.set(key("q"), &result("q", "persisted"), None);
        cache.persist().unwrap();
        assert!(path.exists());

        let reopened = ResultCache::open(&path, 1 << 20, HOUR);
        assert_eq!(reopened.stats().entries, 1);
        assert_eq!(reopened.stats().bytes, cache.stats().bytes);
        let hit = reopened.get(&key("q")).unwrap();
        assert_eq!(hit.files[0].content, "persisted");
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let cache = ResultCache::open(&path, 1 << 20, HOUR);
        assert_eq!(cache.stats().entries, 0);

        // Still usable, and persisting replaces the corrupt file.
        cache.set(key("q"), &result("q", "x"), None);
        cache.persist().unwrap();
        assert_eq!(ResultCache::open(&path, 1 << 20, HOUR).stats().entries, 1);
    }

    #[test]
    fn test_untrusted_sizes_and_sequences_are_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        let payload = serde_json::to_string(&result("a", "x")).unwrap();
        let entry = |payload: &str| {
            serde_json::json!({
                "payload": payload,
                "created_at_ms": now_ms(),
                "seq": u64::MAX,
                "ttl_ms": 3_600_000u64,
                "hits": 0,
                "size_bytes": u64::MAX,
            })
        };
        let mut entries = serde_json::Map::new();
        entries.insert(key("a").to_string(), entry(&payload));
        entries.insert(key("b").to_string(), entry(&payload));
        entries.insert(key("c").to_string(), entry("not a result"));
        let file = serde_json::json!({ "version": FORMAT_VERSION, "entries": entries });
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let cache = ResultCache::open(&path, 1 << 20, HOUR);
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 2 * (payload.len() + key("a").as_str().len()));
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_none());

        // Sequence numbering continues without overflow.
        assert!(cache.set(key("d"), &result("d", "y"), None));
        assert_eq!(cache.stats().entries, 3);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = ResultCache::open(tmp.path().join("absent.json"), 1 << 20, HOUR);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_persist_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be.
        let path = tmp.path().join("cache.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let cache = ResultCache::open(&path, 1 << 20, HOUR);
        cache.set(key("q"), &result("q", "x"), None);
        assert!(matches!(cache.persist(), Err(CacheError::Io(_))));
        // The in-memory cache keeps working.
        assert!(cache.get(&key("q")).is_some());
    }

    #[test]
    fn test_in_memory_persist_is_noop() {
        let cache = ResultCache::new(1 << 20, HOUR);
        assert!(cache.path().is_none());
        assert!(cache.persist().is_ok());
    }

    #[test]
    fn test_shared_across_threads() {
        let cache = std::sync::Arc::new(ResultCache::new(1 << 20, HOUR));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    let k = key(&format!("q{i}"));
                    cache.set(k.clone(), &result("q", "x"), None);
                    cache.get(&k).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(cache.stats().entries, 8);
    }
}
