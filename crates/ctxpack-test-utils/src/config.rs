//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The builder starts from a
//! hermetic baseline: no on-disk cache and no external search tool, so tests
//! never touch the user's data directory or depend on what is installed.

use ctxpack_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_tokens(4000)
///     .external_search(true)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.cache.persist = false;
        config.collector.external_search = false;
        Self { config }
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.collector.default_max_tokens = tokens;
        self
    }

    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.config.collector.max_file_bytes = bytes;
        self
    }

    pub fn external_search(mut self, enabled: bool) -> Self {
        self.config.collector.external_search = enabled;
        self
    }

    pub fn search_binary(mut self, binary: &str) -> Self {
        self.config.collector.external_search = true;
        self.config.collector.search_binary = binary.to_string();
        self
    }

    pub fn policy(mut self, policy: &str) -> Self {
        self.config.collector.default_policy = policy.to_string();
        self
    }

    pub fn extra_ignore(mut self, pattern: &str) -> Self {
        self.config.collector.extra_ignore.push(pattern.to_string());
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_max_bytes(mut self, bytes: usize) -> Self {
        self.config.cache.max_bytes = bytes;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache.ttl_secs = secs;
        self
    }

    /// Mirror the cache to `path`.
    pub fn cache_path(mut self, path: &std::path::Path) -> Self {
        self.config.cache.persist = true;
        self.config.cache.path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
