//! Relevance scoring as an additive priority over canonical status, extension
//! class, recency, and keyword overlap with the query.
//!
//! Components are summed rather than multiplied so each one can be tuned and
//! audited on its own (see [`ScoreBreakdown`]). Keyword overlap comes from a
//! [`MatchBackend`]: the external line-search tool when it is available,
//! otherwise an in-process scan of a bounded prefix of every candidate.
//!
//! The prefix scan only reads the first `fallback_scan_bytes` of each file, so
//! keywords that appear only further down a large file are missed.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use ctxpack_config::ScoringConfig;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exclusion::IgnoreRuleSet;
use crate::process::{probe, run_with_timeout};
use crate::traversal::FileRecord;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

const STOP_WORDS: &[&str] = &[
    "the", "and", "or", "a", "an", "of", "to", "in", "on", "for", "with", "is", "are", "was",
    "were", "be", "been", "this", "that", "these", "those", "it", "its", "as", "at", "by",
    "from", "how", "what", "why", "when", "where", "which", "who", "can", "do", "does", "did",
    "should", "would", "could", "will", "shall", "may", "might", "must", "into", "about",
    "not", "but", "all", "any", "some", "my", "our", "your", "me", "we", "you", "they", "them",
    "there", "then", "than", "also", "just", "please", "have", "has", "had", "out", "over",
    "via", "per", "each", "more", "most", "other", "such", "only", "own", "same", "too", "very",
];

const STRUCTURED_TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "mdx", "rst", "txt", "adoc", "org", "toml", "yaml", "yml", "json",
    "jsonc", "ini", "cfg", "conf", "xml", "csv", "proto", "graphql",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "mjs", "cjs", "jsx", "ts", "tsx", "go", "java", "kt", "kts",
    "scala", "c", "h", "cc", "cpp", "cxx", "hpp", "cs", "fs", "rb", "php", "swift", "m", "mm",
    "sh", "bash", "zsh", "fish", "ps1", "sql", "lua", "dart", "ex", "exs", "erl", "hs", "ml",
    "clj", "vue", "svelte", "css", "scss", "sass", "less", "html", "r", "jl", "pl", "zig", "nim",
];

/// Per-component contributions to a file's priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub canonical: u32,
    pub extension: u32,
    pub recency: u32,
    pub query: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.canonical + self.extension + self.recency + self.query
    }
}

/// A query reduced to the keywords used for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceQuery {
    raw: String,
    keywords: Vec<String>,
}

impl RelevanceQuery {
    /// Lowercase, split on non-word characters, drop stop words and words
    /// shorter than three characters, de-duplicate, and keep the first
    /// `max_keywords` in order of first occurrence.
    pub fn new(raw: &str, max_keywords: usize) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for word in raw.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
            if keywords.len() >= max_keywords {
                break;
            }
            let word = word.to_lowercase();
            if word.chars().count() < 3 || STOP_WORDS.contains(&word.as_str()) {
                continue;
            }
            if !keywords.contains(&word) {
                keywords.push(word);
            }
        }
        Self {
            raw: raw.to_string(),
            keywords,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Query text lowercased with runs of whitespace collapsed.
    pub fn normalized(&self) -> String {
        self.raw
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Coarse content class derived from a file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionClass {
    /// Markdown, config, and other structured text.
    StructuredText,
    /// Program source.
    Source,
    /// Everything else.
    Other,
}

impl ExtensionClass {
    pub fn of(path: &str) -> Self {
        let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
            return ExtensionClass::Other;
        };
        let ext = ext.to_ascii_lowercase();
        if STRUCTURED_TEXT_EXTENSIONS.contains(&ext.as_str()) {
            ExtensionClass::StructuredText
        } else if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
            ExtensionClass::Source
        } else {
            ExtensionClass::Other
        }
    }
}

/// A source of per-file keyword occurrence counts.
pub trait MatchBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Whether the backend can run on this host.
    fn available(&self) -> bool;

    /// Occurrence counts keyed by relative path, for files with at least one
    /// hit. `None` signals a soft failure; the caller falls back.
    fn count_matches(
        &self,
        root: &Path,
        keywords: &[String],
        rules: &IgnoreRuleSet,
        candidates: &[FileRecord],
    ) -> Option<HashMap<String, u32>>;
}

/// Keyword counting through ripgrep.
#[derive(Debug)]
pub struct RipgrepBackend {
    binary: String,
    timeout: Duration,
    max_filesize: u64,
    available: OnceLock<bool>,
}

impl RipgrepBackend {
    pub fn new(binary: impl Into<String>, timeout: Duration, max_filesize: u64) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            max_filesize,
            available: OnceLock::new(),
        }
    }

    fn build_args(&self, keywords: &[String], rules: &IgnoreRuleSet) -> Vec<String> {
        let mut args = vec![
            "--count-matches".to_string(),
            "--ignore-case".to_string(),
            "--fixed-strings".to_string(),
            "--no-messages".to_string(),
            "--no-config".to_string(),
            "--no-ignore".to_string(),
            "--hidden".to_string(),
            "--max-filesize".to_string(),
            self.max_filesize.to_string(),
        ];
        for glob in rules.exclusion_globs() {
            args.extend(["--glob".to_string(), glob]);
        }
        for keyword in keywords {
            args.extend(["-e".to_string(), keyword.clone()]);
        }
        args.push(".".to_string());
        args
    }
}

impl MatchBackend for RipgrepBackend {
    fn name(&self) -> &str {
        "rg"
    }

    fn available(&self) -> bool {
        *self
            .available
            .get_or_init(|| probe(&self.binary, Duration::from_secs(2)))
    }

    fn count_matches(
        &self,
        root: &Path,
        keywords: &[String],
        rules: &IgnoreRuleSet,
        _candidates: &[FileRecord],
    ) -> Option<HashMap<String, u32>> {
        let args = self.build_args(keywords, rules);
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(root).args(&args);

        let output = run_with_timeout(&mut cmd, self.timeout)?;
        // 0 = matches, 1 = no matches, anything else is an error.
        match output.status.code() {
            Some(0) | Some(1) => {}
            other => {
                warn!(
                    backend = "rg",
                    code = ?other,
                    stderr = %output.stderr.trim(),
                    "Search failed, falling back to prefix scan"
                );
                return None;
            }
        }
        Some(parse_count_output(&output.stdout))
    }
}

/// Parse `path:count` lines as printed by `rg --count-matches`.
fn parse_count_output(stdout: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for line in stdout.lines() {
        let Some((path, count)) = line.rsplit_once(':') else {
            continue;
        };
        let Ok(count) = count.trim().parse::<u32>() else {
            continue;
        };
        let path = path.replace('\\', "/");
        let path = path.strip_prefix("./").unwrap_or(&path).to_string();
        if count > 0 {
            counts.insert(path, count);
        }
    }
    counts
}

/// In-process fallback: count keyword occurrences in a bounded prefix of
/// each candidate.
#[derive(Debug, Clone)]
pub struct PrefixScanBackend {
    scan_bytes: usize,
}

impl PrefixScanBackend {
    pub fn new(scan_bytes: usize) -> Self {
        Self { scan_bytes }
    }
}

impl MatchBackend for PrefixScanBackend {
    fn name(&self) -> &str {
        "prefix-scan"
    }

    fn available(&self) -> bool {
        true
    }

    fn count_matches(
        &self,
        root: &Path,
        keywords: &[String],
        _rules: &IgnoreRuleSet,
        candidates: &[FileRecord],
    ) -> Option<HashMap<String, u32>> {
        let mut counts = HashMap::new();
        let mut buf = Vec::with_capacity(self.scan_bytes);
        for record in candidates {
            buf.clear();
            let read = File::open(root.join(&record.path))
                .and_then(|f| f.take(self.scan_bytes as u64).read_to_end(&mut buf));
            if let Err(e) = read {
                debug!(path = %record.path, error = %e, "Prefix scan skipped file");
                continue;
            }
            let haystack = String::from_utf8_lossy(&buf).to_lowercase();
            let hits: usize = keywords.iter().map(|k| haystack.matches(k.as_str()).count()).sum();
            if hits > 0 {
                counts.insert(record.path.clone(), hits.min(u32::MAX as usize) as u32);
            }
        }
        Some(counts)
    }
}

/// Assigns priorities and ranks candidates.
pub struct RelevanceScorer {
    weights: ScoringConfig,
    canonical: GlobSet,
    external: Option<Box<dyn MatchBackend>>,
    fallback: PrefixScanBackend,
}

impl RelevanceScorer {
    pub fn new(
        weights: ScoringConfig,
        external: Option<Box<dyn MatchBackend>>,
        fallback: PrefixScanBackend,
    ) -> Self {
        let canonical = compile_canonical(&weights.canonical_patterns);
        Self {
            weights,
            canonical,
            external,
            fallback,
        }
    }

    /// Whether an external backend is configured and usable on this host.
    pub fn external_available(&self) -> bool {
        self.external.as_ref().is_some_and(|b| b.available())
    }

    /// Whether `path` is a canonical artifact.
    pub fn is_canonical(&self, path: &str) -> bool {
        self.canonical.is_match(path)
    }

    /// Score `records` in place and sort them by descending priority, then path.
    ///
    /// Returns whether the external backend produced the keyword counts.
    pub fn score(
        &self,
        root: &Path,
        rules: &IgnoreRuleSet,
        records: &mut [FileRecord],
        recent: &BTreeSet<String>,
        query: &RelevanceQuery,
        now: SystemTime,
    ) -> bool {
        let (counts, external_used) = self.keyword_counts(root, rules, records, query);

        for record in records.iter_mut() {
            let score = ScoreBreakdown {
                canonical: if self.is_canonical(&record.path) {
                    self.weights.canonical_boost
                } else {
                    0
                },
                extension: self.extension_boost(&record.path),
                recency: self.recency_boost(record.modified, now, recent.contains(&record.path)),
                query: self.query_boost(
                    &record.path,
                    counts.get(&record.path).copied().unwrap_or(0),
                    query.keywords(),
                ),
            };
            record.score = score;
            record.priority = score.total();
        }

        rank(records);
        external_used
    }

    fn keyword_counts(
        &self,
        root: &Path,
        rules: &IgnoreRuleSet,
        records: &[FileRecord],
        query: &RelevanceQuery,
    ) -> (HashMap<String, u32>, bool) {
        let keywords = query.keywords();
        if keywords.is_empty() {
            debug!("No keywords, skipping query match");
            return (HashMap::new(), false);
        }

        if let Some(backend) = self.external.as_deref() {
            if !backend.available() {
                info!(backend = backend.name(), "External search unavailable, using prefix scan");
            } else if let Some(counts) = backend.count_matches(root, keywords, rules, records) {
                debug!(backend = backend.name(), files = counts.len(), "Keyword matches");
                return (counts, true);
            }
        }

        let counts = self
            .fallback
            .count_matches(root, keywords, rules, records)
            .unwrap_or_default();
        debug!(backend = self.fallback.name(), files = counts.len(), "Keyword matches");
        (counts, false)
    }

    fn extension_boost(&self, path: &str) -> u32 {
        match ExtensionClass::of(path) {
            ExtensionClass::StructuredText => self.weights.structured_text_boost,
            ExtensionClass::Source => self.weights.source_code_boost,
            ExtensionClass::Other => self.weights.other_boost,
        }
    }

    fn recency_boost(&self, modified: SystemTime, now: SystemTime, vcs_recent: bool) -> u32 {
        // Modification times in the future count as brand new.
        let age = now.duration_since(modified).unwrap_or_default().as_secs();
        let tier = if age < DAY {
            self.weights.recency_day_boost
        } else if age < 7 * DAY {
            self.weights.recency_week_boost
        } else if age < 30 * DAY {
            self.weights.recency_month_boost
        } else {
            0
        };
        let boost = if vcs_recent {
            tier.max(self.weights.vcs_recent_boost)
        } else {
            tier
        };
        boost.min(self.weights.recency_cap)
    }

    fn query_boost(&self, path: &str, hits: u32, keywords: &[String]) -> u32 {
        if keywords.is_empty() {
            return 0;
        }
        let lowered = path.to_lowercase();
        let path_bonus = if keywords.iter().any(|k| lowered.contains(k.as_str())) {
            self.weights.path_match_boost
        } else {
            0
        };
        hits.saturating_mul(self.weights.match_boost_per_hit)
            .saturating_add(path_bonus)
            .min(self.weights.match_cap)
    }
}

/// Sort by descending priority, breaking ties by ascending path.
pub fn rank(records: &mut [FileRecord]) {
    records.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.path.cmp(&b.path)));
}

fn compile_canonical(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match GlobBuilder::new(pattern)
            .literal_separator(true)
            .case_insensitive(true)
            .build()
        {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Skipping malformed canonical pattern"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to compile canonical patterns");
        GlobSet::empty()
    })
}
