#![deny(unsafe_code)]

//! Configuration loading and validation for ctxpack.
//!
//! Loads TOML configuration files and validates them against expected ranges.
//! Provides the [`AppConfig`] type as the central configuration structure. Every
//! field carries a default, so an empty file (or no file at all) yields a usable
//! configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Candidate discovery, search, and assembly settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Additive relevance weights.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Token estimator ratios.
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for traversal, keyword search, and budget assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Token budget used when a caller does not supply one.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Files larger than this are excluded during traversal.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// How many leading bytes are sniffed for a NUL byte.
    #[serde(default = "default_binary_sniff_bytes")]
    pub binary_sniff_bytes: usize,

    /// Window for the version-control recency source, in days.
    #[serde(default = "default_recency_days")]
    pub recency_days: u32,

    /// Ignore files read from the project root, in order.
    #[serde(default = "default_ignore_files")]
    pub ignore_files: Vec<String>,

    /// Additional ignore patterns appended after the ignore files.
    #[serde(default)]
    pub extra_ignore: Vec<String>,

    /// Maximum number of query keywords kept after stop-word removal.
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,

    /// Prefix length read per file by the in-process keyword scan.
    #[serde(default = "default_fallback_scan_bytes")]
    pub fallback_scan_bytes: usize,

    /// Whether the external line-search utility may be used.
    #[serde(default = "default_true")]
    pub external_search: bool,

    /// Binary name (or path) of the external line-search utility.
    #[serde(default = "default_search_binary")]
    pub search_binary: String,

    /// Wall-clock limit for one external search invocation.
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,

    /// Wall-clock limit for the version-control recency query.
    #[serde(default = "default_vcs_timeout_secs")]
    pub vcs_timeout_secs: u64,

    /// Smallest remaining budget worth spending on a boundary summary.
    #[serde(default = "default_min_summary_tokens")]
    pub min_summary_tokens: u32,

    /// Lines of context kept around each hit by the selective policy.
    #[serde(default = "default_selective_context_lines")]
    pub selective_context_lines: usize,

    /// Leading lines kept by the minimal policy.
    #[serde(default = "default_minimal_lines")]
    pub minimal_lines: usize,

    /// Injection policy used when a caller does not pick one:
    /// "full", "selective", "sectional", or "minimal".
    #[serde(default = "default_policy")]
    pub default_policy: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
            max_file_bytes: default_max_file_bytes(),
            binary_sniff_bytes: default_binary_sniff_bytes(),
            recency_days: default_recency_days(),
            ignore_files: default_ignore_files(),
            extra_ignore: Vec::new(),
            max_keywords: default_max_keywords(),
            fallback_scan_bytes: default_fallback_scan_bytes(),
            external_search: true,
            search_binary: default_search_binary(),
            search_timeout_secs: default_search_timeout_secs(),
            vcs_timeout_secs: default_vcs_timeout_secs(),
            min_summary_tokens: default_min_summary_tokens(),
            selective_context_lines: default_selective_context_lines(),
            minimal_lines: default_minimal_lines(),
            default_policy: default_policy(),
        }
    }
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_max_file_bytes() -> u64 {
    100 * 1024
}

fn default_binary_sniff_bytes() -> usize {
    8192
}

fn default_recency_days() -> u32 {
    7
}

fn default_ignore_files() -> Vec<String> {
    vec![".gitignore".to_string(), ".ctxpackignore".to_string()]
}

fn default_max_keywords() -> usize {
    8
}

fn default_fallback_scan_bytes() -> usize {
    10 * 1024
}

fn default_true() -> bool {
    true
}

fn default_search_binary() -> String {
    "rg".to_string()
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_vcs_timeout_secs() -> u64 {
    5
}

fn default_min_summary_tokens() -> u32 {
    64
}

fn default_selective_context_lines() -> usize {
    3
}

fn default_minimal_lines() -> usize {
    40
}

fn default_policy() -> String {
    "full".to_string()
}

/// Additive relevance weights.
///
/// Each component is computed independently and summed, so any one of them
/// can be tuned without rescaling the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Bonus for canonical artifacts (README, manifests, spec/plan documents).
    #[serde(default = "default_canonical_boost")]
    pub canonical_boost: u32,

    /// Bonus for markdown, config, and other structured text.
    #[serde(default = "default_structured_text_boost")]
    pub structured_text_boost: u32,

    /// Bonus for source code.
    #[serde(default = "default_source_code_boost")]
    pub source_code_boost: u32,

    /// Bonus for every other extension.
    #[serde(default = "default_other_boost")]
    pub other_boost: u32,

    /// Recency bonus for files modified within the last 24 hours.
    #[serde(default = "default_recency_day_boost")]
    pub recency_day_boost: u32,

    /// Recency bonus for files modified within the last 7 days.
    #[serde(default = "default_recency_week_boost")]
    pub recency_week_boost: u32,

    /// Recency bonus for files modified within the last 30 days.
    #[serde(default = "default_recency_month_boost")]
    pub recency_month_boost: u32,

    /// Recency floor for files reported by version control as recently changed.
    #[serde(default = "default_vcs_recent_boost")]
    pub vcs_recent_boost: u32,

    /// Upper bound on the total recency component.
    #[serde(default = "default_recency_cap")]
    pub recency_cap: u32,

    /// Bonus per keyword occurrence.
    #[serde(default = "default_match_boost_per_hit")]
    pub match_boost_per_hit: u32,

    /// Bonus when a keyword appears in the file path.
    #[serde(default = "default_path_match_boost")]
    pub path_match_boost: u32,

    /// Upper bound on the total query-match component.
    #[serde(default = "default_match_cap")]
    pub match_cap: u32,

    /// Glob patterns (relative to the root, case-insensitive) marking canonical artifacts.
    #[serde(default = "default_canonical_patterns")]
    pub canonical_patterns: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            canonical_boost: default_canonical_boost(),
            structured_text_boost: default_structured_text_boost(),
            source_code_boost: default_source_code_boost(),
            other_boost: default_other_boost(),
            recency_day_boost: default_recency_day_boost(),
            recency_week_boost: default_recency_week_boost(),
            recency_month_boost: default_recency_month_boost(),
            vcs_recent_boost: default_vcs_recent_boost(),
            recency_cap: default_recency_cap(),
            match_boost_per_hit: default_match_boost_per_hit(),
            path_match_boost: default_path_match_boost(),
            match_cap: default_match_cap(),
            canonical_patterns: default_canonical_patterns(),
        }
    }
}

fn default_canonical_boost() -> u32 {
    100
}

fn default_structured_text_boost() -> u32 {
    20
}

fn default_source_code_boost() -> u32 {
    15
}

fn default_other_boost() -> u32 {
    5
}

fn default_recency_day_boost() -> u32 {
    30
}

fn default_recency_week_boost() -> u32 {
    20
}

fn default_recency_month_boost() -> u32 {
    10
}

fn default_vcs_recent_boost() -> u32 {
    15
}

fn default_recency_cap() -> u32 {
    30
}

fn default_match_boost_per_hit() -> u32 {
    5
}

fn default_path_match_boost() -> u32 {
    10
}

fn default_match_cap() -> u32 {
    50
}

fn default_canonical_patterns() -> Vec<String> {
    [
        "README*",
        "CONTRIBUTING*",
        "CLAUDE.md",
        "AGENTS.md",
        "Cargo.toml",
        "package.json",
        "pyproject.toml",
        "setup.py",
        "setup.cfg",
        "requirements*.txt",
        "go.mod",
        "Gemfile",
        "pom.xml",
        "build.gradle",
        "build.gradle.kts",
        "composer.json",
        "Makefile",
        "Justfile",
        "CMakeLists.txt",
        "Dockerfile",
        "docker-compose.yml",
        "specs/**/*.md",
        ".specify/**/*.md",
        "docs/specs/**/*.md",
        "**/spec.md",
        "**/plan.md",
        "**/tasks.md",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Token estimator ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Baseline characters per token.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    /// Multiplier applied when text looks like source code.
    #[serde(default = "default_code_multiplier")]
    pub code_multiplier: f64,

    /// Multiplier applied when text is dense in non-ASCII characters.
    #[serde(default = "default_non_ascii_multiplier")]
    pub non_ascii_multiplier: f64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            code_multiplier: default_code_multiplier(),
            non_ascii_multiplier: default_non_ascii_multiplier(),
        }
    }
}

fn default_chars_per_token() -> f64 {
    4.0
}

fn default_code_multiplier() -> f64 {
    1.2
}

fn default_non_ascii_multiplier() -> f64 {
    1.5
}

/// Result cache configuration.
///
/// ## TOML Example
///
/// ```toml
/// [cache]
/// ttl_secs = 1800
/// max_bytes = 4194304
/// path = "/var/cache/ctxpack/cache.json"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether collection results are memoized at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Ceiling on the cumulative size of stored entries.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,

    /// Whether the cache is mirrored to disk between runs.
    #[serde(default = "default_true")]
    pub persist: bool,

    /// On-disk cache file. Defaults to a file under the platform data directory.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_bytes: default_cache_max_bytes(),
            persist: true,
            path: None,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_bytes() -> usize {
    8 * 1024 * 1024 // 8 MiB
}

impl CacheConfig {
    /// Resolve the on-disk cache location, if persistence is enabled.
    ///
    /// Returns `None` when persistence is off or no data directory exists on
    /// this platform.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        match &self.path {
            Some(p) => Some(PathBuf::from(p)),
            None => dirs::data_local_dir().map(|d| d.join("ctxpack").join("cache.json")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.collector;
        if c.default_max_tokens == 0 {
            return Err(ConfigError::Validation(
                "collector.default_max_tokens must be non-zero".to_string(),
            ));
        }
        if c.max_file_bytes == 0 {
            return Err(ConfigError::Validation(
                "collector.max_file_bytes must be non-zero".to_string(),
            ));
        }
        if c.binary_sniff_bytes == 0 || c.fallback_scan_bytes == 0 {
            return Err(ConfigError::Validation(
                "collector.binary_sniff_bytes and collector.fallback_scan_bytes must be non-zero"
                    .to_string(),
            ));
        }
        if c.max_keywords == 0 {
            return Err(ConfigError::Validation(
                "collector.max_keywords must be at least 1".to_string(),
            ));
        }
        if c.search_timeout_secs == 0 || c.vcs_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "collector timeouts must be non-zero".to_string(),
            ));
        }
        if c.search_binary.is_empty() {
            return Err(ConfigError::Validation(
                "collector.search_binary must not be empty".to_string(),
            ));
        }
        let valid_policies = ["full", "selective", "sectional", "minimal"];
        if !valid_policies.contains(&c.default_policy.as_str()) {
            return Err(ConfigError::Validation(format!(
                "collector.default_policy must be one of {:?}, got {:?}",
                valid_policies, c.default_policy
            )));
        }

        let s = &self.scoring;
        if s.recency_cap > s.canonical_boost {
            return Err(ConfigError::Validation(format!(
                "scoring.recency_cap ({}) must not exceed scoring.canonical_boost ({})",
                s.recency_cap, s.canonical_boost
            )));
        }
        if s.match_cap >= s.canonical_boost {
            return Err(ConfigError::Validation(format!(
                "scoring.match_cap ({}) must be below scoring.canonical_boost ({})",
                s.match_cap, s.canonical_boost
            )));
        }

        let t = &self.tokens;
        if !(t.chars_per_token > 0.0) {
            return Err(ConfigError::Validation(format!(
                "tokens.chars_per_token must be positive, got {}",
                t.chars_per_token
            )));
        }
        if t.code_multiplier < 1.0 || t.non_ascii_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "token multipliers must be >= 1.0, got code={} non_ascii={}",
                t.code_multiplier, t.non_ascii_multiplier
            )));
        }

        if self.cache.enabled && self.cache.max_bytes == 0 {
            return Err(ConfigError::Validation(
                "cache.max_bytes must be non-zero when the cache is enabled".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.collector.default_max_tokens, 8000);
        assert_eq!(config.collector.max_file_bytes, 102_400);
        assert_eq!(config.collector.fallback_scan_bytes, 10_240);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.collector.search_binary, "rg");
        assert_eq!(
            config.collector.ignore_files,
            vec![".gitignore".to_string(), ".ctxpackignore".to_string()]
        );
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [collector]
            default_max_tokens = 2000
            recency_days = 14
            extra_ignore = ["*.snap", "fixtures/"]
            external_search = false
            default_policy = "selective"

            [scoring]
            canonical_boost = 200
            match_cap = 80

            [tokens]
            chars_per_token = 3.5

            [cache]
            ttl_secs = 60
            persist = false

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.collector.default_max_tokens, 2000);
        assert_eq!(config.collector.recency_days, 14);
        assert_eq!(config.collector.extra_ignore.len(), 2);
        assert!(!config.collector.external_search);
        assert_eq!(config.collector.default_policy, "selective");
        assert_eq!(config.scoring.canonical_boost, 200);
        assert_eq!(config.scoring.match_cap, 80);
        assert_eq!(config.tokens.chars_per_token, 3.5);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let toml = r#"
            [collector]
            default_max_tokens = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_policy() {
        let toml = r#"
            [collector]
            default_policy = "everything"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_match_cap_above_canonical() {
        let toml = r#"
            [scoring]
            canonical_boost = 40
            match_cap = 50
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_recency_cap_above_canonical() {
        let toml = r#"
            [scoring]
            canonical_boost = 60
            recency_cap = 70
            match_cap = 10
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_token_ratio() {
        assert!(AppConfig::parse("[tokens]\nchars_per_token = 0.0\n").is_err());
        assert!(AppConfig::parse("[tokens]\ncode_multiplier = 0.5\n").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_cache_ceiling() {
        assert!(AppConfig::parse("[cache]\nmax_bytes = 0\n").is_err());
        // A disabled cache does not need a ceiling.
        assert!(AppConfig::parse("[cache]\nenabled = false\nmax_bytes = 0\n").is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        assert!(AppConfig::parse("[logging]\nlevel = \"loud\"\n").is_err());
    }

    #[test]
    fn test_cache_path_resolution() {
        let mut cache = CacheConfig {
            path: Some("/tmp/ctxpack-cache.json".to_string()),
            ..CacheConfig::default()
        };
        assert_eq!(
            cache.resolved_path(),
            Some(PathBuf::from("/tmp/ctxpack-cache.json"))
        );

        cache.persist = false;
        assert_eq!(cache.resolved_path(), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ctxpack.toml");
        tokio::fs::write(&path, b"[collector]\nrecency_days = 3\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.collector.recency_days, 3);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
