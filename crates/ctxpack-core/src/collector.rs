//! The collection entry point.
//!
//! A [`Collector`] is built once per project root. It owns the compiled ignore
//! rules, the traversal engine, the scorer, the assembler, and (optionally) a
//! shared [`ResultCache`]. [`Collector::collect`] runs synchronously on the
//! caller's thread; the collector itself is `Sync`, so one instance can serve
//! concurrent callers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ctxpack_config::AppConfig;
use tracing::{debug, info, warn};

use crate::assembler::{AssemblerSettings, Budget, BudgetAssembler, InjectionPolicy};
use crate::cache::{CacheKey, CapabilityFingerprint, ResultCache, digest_hex};
use crate::exclusion::IgnoreRuleSet;
use crate::relevance::{MatchBackend, PrefixScanBackend, RelevanceQuery, RelevanceScorer, RipgrepBackend};
use crate::result::{CollectionMetadata, CollectionResult};
use crate::tokens::TokenEstimator;
use crate::traversal::{TraversalEngine, TraversalSettings};

/// The only failures that reach a caller: the project root itself is unusable.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("project root does not exist: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("project root is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("project root is unreadable: {}: {source}", .path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-call options. Unset limits fall back to the collector's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOptions {
    pub max_tokens: Option<u32>,
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
    pub use_cache: bool,
    pub policy: Option<InjectionPolicy>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_files: None,
            max_total_bytes: None,
            use_cache: true,
            policy: None,
        }
    }
}

impl CollectOptions {
    pub fn with_max_tokens(max_tokens: u32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Self::default()
        }
    }
}

/// Relevance-ranked, budgeted context collection for one project root.
pub struct Collector {
    root: PathBuf,
    rules: Arc<IgnoreRuleSet>,
    traversal: TraversalEngine,
    scorer: RelevanceScorer,
    assembler: BudgetAssembler,
    cache: Option<Arc<ResultCache>>,
    settings_digest: String,
    default_max_tokens: u32,
    default_policy: InjectionPolicy,
    max_keywords: usize,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("root", &self.root)
            .field("cache", &self.cache.is_some())
            .field("default_max_tokens", &self.default_max_tokens)
            .field("default_policy", &self.default_policy)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Build a collector from configuration.
    ///
    /// The cache (if enabled) and the external search backend (if enabled)
    /// are created from `config`.
    pub fn new(root: impl AsRef<Path>, config: &AppConfig) -> Result<Self, CollectError> {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResultCache::from_config(&config.cache)));
        let external: Option<Box<dyn MatchBackend>> = config.collector.external_search.then(|| {
            Box::new(RipgrepBackend::new(
                config.collector.search_binary.clone(),
                Duration::from_secs(config.collector.search_timeout_secs),
                config.collector.max_file_bytes,
            )) as Box<dyn MatchBackend>
        });
        Self::with_parts(root, config, cache, external)
    }

    /// Build a collector with an explicit cache and external backend.
    pub fn with_parts(
        root: impl AsRef<Path>,
        config: &AppConfig,
        cache: Option<Arc<ResultCache>>,
        external: Option<Box<dyn MatchBackend>>,
    ) -> Result<Self, CollectError> {
        let root = validate_root(root.as_ref())?;
        let root = fs::canonicalize(&root).map_err(|source| CollectError::RootUnreadable {
            path: root.clone(),
            source,
        })?;

        let collector_config = &config.collector;
        let rules = Arc::new(IgnoreRuleSet::load(
            &root,
            &collector_config.ignore_files,
            &collector_config.extra_ignore,
        ));
        let traversal = TraversalEngine::new(
            &root,
            Arc::clone(&rules),
            TraversalSettings::from(collector_config),
        );
        let scorer = RelevanceScorer::new(
            config.scoring.clone(),
            external,
            PrefixScanBackend::new(collector_config.fallback_scan_bytes),
        );
        let assembler = BudgetAssembler::new(
            &root,
            TokenEstimator::new(&config.tokens),
            AssemblerSettings::from(collector_config),
        );
        let default_policy = collector_config.default_policy.parse().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to the full injection policy");
            InjectionPolicy::Full
        });
        let settings_digest = serde_json::to_vec(&(collector_config, &config.scoring, &config.tokens))
            .map(|bytes| digest_hex(&bytes))
            .unwrap_or_default();

        info!(
            root = %root.display(),
            patterns = rules.patterns().len(),
            cache = cache.is_some(),
            "Collector ready"
        );

        Ok(Self {
            root,
            rules,
            traversal,
            scorer,
            assembler,
            cache,
            settings_digest,
            default_max_tokens: collector_config.default_max_tokens,
            default_policy,
            max_keywords: collector_config.max_keywords,
        })
    }

    /// Canonical project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &IgnoreRuleSet {
        &self.rules
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_deref()
    }

    /// Fingerprint of what this collector can do on this host right now.
    pub fn fingerprint(&self) -> CapabilityFingerprint {
        CapabilityFingerprint::new(self.scorer.external_available(), self.settings_digest.clone())
    }

    /// Select, rank, and budget files relevant to `query`.
    pub fn collect(
        &self,
        query: &str,
        options: &CollectOptions,
    ) -> Result<CollectionResult, CollectError> {
        validate_root(&self.root)?;

        let query = RelevanceQuery::new(query, self.max_keywords);
        let budget = Budget {
            max_tokens: options.max_tokens.unwrap_or(self.default_max_tokens),
            max_files: options.max_files,
            max_total_bytes: options.max_total_bytes,
        };
        let policy = options.policy.unwrap_or(self.default_policy);

        let cache = self.cache.as_deref().filter(|_| options.use_cache);
        let key = cache.map(|_| {
            CacheKey::compute(&self.root, &query.normalized(), &budget, policy, &self.fingerprint())
        });
        if let (Some(cache), Some(key)) = (cache, key.as_ref())
            && let Some(mut hit) = cache.get(key)
        {
            // The key covers the normalized query; echo this caller's text.
            hit.query = query.raw().to_string();
            info!(root = %self.root.display(), key = %key, files = hit.files.len(), "Cache hit");
            return Ok(hit);
        }

        let started = Instant::now();
        let candidates = self.traversal.collect_candidates();
        let mut records = candidates.records;
        let external_search_used = self.scorer.score(
            &self.root,
            &self.rules,
            &mut records,
            &candidates.recent,
            &query,
            SystemTime::now(),
        );
        let assembly = self
            .assembler
            .assemble(&records, budget, policy, query.keywords());
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = CollectionResult {
            query: query.raw().to_string(),
            files: assembly.files,
            metadata: CollectionMetadata {
                files_scanned: candidates.files_scanned,
                excluded_count: candidates.excluded + assembly.read_failures,
                total_tokens: assembly.total_tokens,
                max_tokens: budget.max_tokens,
                elapsed_ms,
                external_search_used,
                cached: false,
                keywords: query.keywords().to_vec(),
            },
        };
        info!(
            root = %self.root.display(),
            files = result.files.len(),
            tokens = result.metadata.total_tokens,
            scanned = result.metadata.files_scanned,
            excluded = result.metadata.excluded_count,
            external_search = external_search_used,
            elapsed_ms,
            "Collection complete"
        );

        if let (Some(cache), Some(key)) = (cache, key)
            && cache.set(key, &result, None)
            && let Err(e) = cache.persist()
        {
            warn!(error = %e, "Failed to persist result cache");
        }

        Ok(result)
    }
}

/// Check that `root` is an existing, listable directory.
fn validate_root(root: &Path) -> Result<PathBuf, CollectError> {
    let metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CollectError::RootNotFound(root.to_path_buf()));
        }
        Err(source) => {
            return Err(CollectError::RootUnreadable {
                path: root.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_dir() {
        return Err(CollectError::RootNotDirectory(root.to_path_buf()));
    }
    fs::read_dir(root).map_err(|source| CollectError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    debug!(root = %root.display(), "Root validated");
    Ok(root.to_path_buf())
}
