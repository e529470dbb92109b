//! Candidate discovery from version-control recency and a pruned tree walk.
//!
//! Two sources feed the candidate list:
//!
//! 1. **Recency**: `git log` over the last N days. Small, high-value, and
//!    entirely optional: any failure yields an empty set.
//! 2. **Full scan**: a sorted walk of the tree that prunes ignored
//!    directories before descending into them.
//!
//! Both go through the same admission checks (ignore rules, size ceiling,
//! binary detection) and are de-duplicated by relative path.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ctxpack_config::CollectorConfig;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::exclusion::IgnoreRuleSet;
use crate::process::run_with_timeout;
use crate::relevance::ScoreBreakdown;

/// Extensions excluded without reading any content.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tif", "tiff", "psd", "pdf", "zip", "gz",
    "tgz", "bz2", "xz", "7z", "rar", "tar", "jar", "war", "class", "so", "dylib", "dll", "exe",
    "o", "a", "lib", "obj", "bin", "wasm", "pyc", "woff", "woff2", "ttf", "otf", "eot", "mp3",
    "mp4", "wav", "flac", "ogg", "avi", "mov", "mkv", "webm", "db", "sqlite", "sqlite3", "iso",
    "dmg",
];

/// A candidate file discovered during traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// Size in bytes at discovery time.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Outcome of binary detection. Traversal drops binary files before a
    /// record is built, so every record it returns carries `false`.
    pub is_binary: bool,
    /// Total relevance priority (sum of `score`).
    pub priority: u32,
    /// Per-component contributions to `priority`.
    pub score: ScoreBreakdown,
}

/// Knobs for candidate discovery.
#[derive(Debug, Clone)]
pub struct TraversalSettings {
    pub max_file_bytes: u64,
    pub binary_sniff_bytes: usize,
    pub recency_days: u32,
    pub vcs_timeout: Duration,
}

impl From<&CollectorConfig> for TraversalSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            binary_sniff_bytes: config.binary_sniff_bytes,
            recency_days: config.recency_days,
            vcs_timeout: Duration::from_secs(config.vcs_timeout_secs),
        }
    }
}

impl Default for TraversalSettings {
    fn default() -> Self {
        Self::from(&CollectorConfig::default())
    }
}

/// Output of one traversal.
#[derive(Debug, Default)]
pub struct Candidates {
    /// Admitted files, sorted by path.
    pub records: Vec<FileRecord>,
    /// Distinct non-ignored files examined.
    pub files_scanned: usize,
    /// Files rejected for size, binary content, or read errors.
    pub excluded: usize,
    /// Paths version control reported as recently changed (and admitted).
    pub recent: BTreeSet<String>,
}

/// Walks one project root. Read-only once constructed.
#[derive(Debug)]
pub struct TraversalEngine {
    root: PathBuf,
    rules: Arc<IgnoreRuleSet>,
    settings: TraversalSettings,
}

#[derive(Default)]
struct ScanState {
    admitted: BTreeMap<String, FileRecord>,
    seen: HashSet<String>,
    excluded: usize,
}

impl TraversalEngine {
    pub fn new(root: impl Into<PathBuf>, rules: Arc<IgnoreRuleSet>, settings: TraversalSettings) -> Self {
        Self {
            root: root.into(),
            rules,
            settings,
        }
    }

    /// Gather candidates from both sources.
    pub fn collect_candidates(&self) -> Candidates {
        let mut state = ScanState::default();
        let mut recent = BTreeSet::new();
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());

        for path in self.recent_paths().unwrap_or_default() {
            let abs = self.root.join(&path);
            // Deleted or renamed since the commit.
            let Ok(metadata) = std::fs::symlink_metadata(&abs) else {
                continue;
            };
            // Symlinks are skipped here as in the scan.
            if !metadata.is_file() || self.rules.is_ignored(Path::new(&path), false) {
                continue;
            }
            if !abs
                .canonicalize()
                .is_ok_and(|resolved| resolved.starts_with(&canonical_root))
            {
                debug!(path = %path, "Skipping recent path outside the root");
                continue;
            }
            if self.examine(&mut state, path.clone(), &abs, &metadata) {
                recent.insert(path);
            }
        }

        self.scan(&mut state);

        let candidates = Candidates {
            files_scanned: state.seen.len(),
            excluded: state.excluded,
            records: state.admitted.into_values().collect(),
            recent,
        };
        info!(
            root = %self.root.display(),
            admitted = candidates.records.len(),
            scanned = candidates.files_scanned,
            excluded = candidates.excluded,
            recent = candidates.recent.len(),
            "Traversal complete"
        );
        candidates
    }

    /// Paths changed in the last `recency_days`, relative to the root.
    ///
    /// `None` when version control is unavailable, times out, or the root is
    /// not inside a repository.
    pub fn recent_paths(&self) -> Option<Vec<String>> {
        let since = format!("--since={} days ago", self.settings.recency_days);
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(["log", "--name-only", "--pretty=format:", "--relative"])
            .arg(since);

        let output = run_with_timeout(&mut cmd, self.settings.vcs_timeout)?;
        if !output.status.success() {
            debug!(
                root = %self.root.display(),
                stderr = %output.stderr.trim(),
                "Version control recency unavailable"
            );
            return None;
        }

        let mut seen = HashSet::new();
        let paths: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect();
        debug!(count = paths.len(), "Recently changed paths");
        Some(paths)
    }

    fn scan(&self, state: &mut ScanState) {
        let rules = Arc::clone(&self.rules);
        let root = self.root.clone();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                !rules.is_ignored(relative, entry.file_type().is_dir())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    state.excluded += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_path(&self.root, entry.path()) else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 path");
                state.excluded += 1;
                continue;
            };
            if state.seen.contains(&relative) {
                continue;
            }
            match entry.metadata() {
                Ok(metadata) => {
                    self.examine(state, relative, entry.path(), &metadata);
                }
                Err(e) => {
                    debug!(path = %relative, error = %e, "Skipping file without metadata");
                    state.seen.insert(relative);
                    state.excluded += 1;
                }
            }
        }
    }

    /// Apply the size and binary checks. Returns whether the file was admitted.
    fn examine(
        &self,
        state: &mut ScanState,
        relative: String,
        abs: &Path,
        metadata: &std::fs::Metadata,
    ) -> bool {
        if !state.seen.insert(relative.clone()) {
            return state.admitted.contains_key(&relative);
        }

        let size = metadata.len();
        if size > self.settings.max_file_bytes {
            debug!(path = %relative, size, limit = self.settings.max_file_bytes, "Skipping large file");
            state.excluded += 1;
            return false;
        }
        if has_binary_extension(abs) {
            debug!(path = %relative, "Skipping binary extension");
            state.excluded += 1;
            return false;
        }
        match sniff_binary(abs, self.settings.binary_sniff_bytes) {
            Ok(false) => {}
            Ok(true) => {
                debug!(path = %relative, "Skipping binary content");
                state.excluded += 1;
                return false;
            }
            Err(e) => {
                debug!(path = %relative, error = %e, "Skipping unreadable file");
                state.excluded += 1;
                return false;
            }
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        state.admitted.insert(
            relative.clone(),
            FileRecord {
                path: relative,
                size,
                modified,
                is_binary: false,
                priority: 0,
                score: ScoreBreakdown::default(),
            },
        );
        true
    }
}

/// Whether the extension marks a known binary format.
pub fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            BINARY_EXTENSIONS.contains(&ext.as_str())
        })
}

/// Whether the first `limit` bytes contain a NUL byte.
pub fn sniff_binary(path: &Path, limit: usize) -> std::io::Result<bool> {
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    File::open(path)?.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf.contains(&0))
}

/// `/`-joined path of `path` relative to `root`, if it is valid UTF-8.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
