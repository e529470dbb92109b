//! Exclusion rules from project ignore files and built-in defaults.
//!
//! An [`IgnoreRuleSet`] is compiled once per project root and then shared
//! read-only by every stage of a collection call. Ignore files use standard
//! gitignore syntax (`#` comments, `/` anchors, `**` wildcards, trailing `/`
//! directory markers, `!` negation).
//!
//! Built-in defaults are appended *after* the project's own ignore files. Since
//! the last matching pattern wins, a project file cannot re-include a
//! dependency cache or VCS directory with a negation.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

/// Patterns that are always excluded, whatever the project's ignore files say.
pub const BUILTIN_PATTERNS: &[&str] = &[
    // Version control
    ".git/",
    ".hg/",
    ".svn/",
    ".bzr/",
    // Dependency caches
    "node_modules/",
    "bower_components/",
    ".pnpm-store/",
    ".venv/",
    "venv/",
    "__pycache__/",
    ".mypy_cache/",
    ".pytest_cache/",
    ".tox/",
    ".gradle/",
    "vendor/bundle/",
    // Build output
    "target/",
    "dist/",
    "build/",
    "out/",
    ".next/",
    ".nuxt/",
    ".turbo/",
    ".parcel-cache/",
    ".cache/",
    "coverage/",
    "*.pyc",
    "*.pyo",
    "*.class",
    // Editors and OS artifacts
    ".idea/",
    ".vscode/",
    "*.swp",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Our own data
    ".ctxpack/",
];

/// Compiled exclusion rules for one project root.
#[derive(Debug)]
pub struct IgnoreRuleSet {
    root: PathBuf,
    matcher: Gitignore,
    /// Patterns in evaluation order (project files first, then defaults).
    patterns: Vec<String>,
    /// Ignore files that were actually read.
    sources: Vec<PathBuf>,
}

impl IgnoreRuleSet {
    /// Compile the rules for `root`.
    ///
    /// Each name in `ignore_files` is looked up at the project root. Missing or
    /// unreadable files are skipped with a log line; malformed patterns are
    /// skipped individually. This never fails.
    pub fn load(root: &Path, ignore_files: &[String], extra: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let mut patterns = Vec::new();
        let mut sources = Vec::new();

        for name in ignore_files {
            let path = root.join(name);
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No ignore file");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable ignore file, skipping");
                    continue;
                }
            };
            for line in content.lines() {
                add_pattern(&mut builder, &mut patterns, Some(&path), line);
            }
            sources.push(path);
        }

        for line in extra {
            add_pattern(&mut builder, &mut patterns, None, line);
        }
        for line in BUILTIN_PATTERNS {
            add_pattern(&mut builder, &mut patterns, None, line);
        }

        let matcher = match builder.build() {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to compile ignore rules");
                Gitignore::empty()
            }
        };

        debug!(
            root = %root.display(),
            patterns = patterns.len(),
            sources = sources.len(),
            "Compiled ignore rules"
        );

        Self {
            root: root.to_path_buf(),
            matcher,
            patterns,
            sources,
        }
    }

    /// Rules consisting of the built-in defaults only.
    pub fn builtin(root: &Path) -> Self {
        Self::load(root, &[], &[])
    }

    /// Whether `path` (relative to the root) is excluded.
    ///
    /// A path is also excluded when any of its parent directories is, so this
    /// is safe to call on paths that did not come from a pruned walk.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if relative.as_os_str().is_empty() || relative.has_root() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    /// Project root these rules were compiled for.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All active patterns in evaluation order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Ignore files that contributed patterns.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Exclusion globs for an external search tool (`!pattern` form).
    ///
    /// Negated patterns are dropped: the tool only gets a coarse pre-filter,
    /// and every path it reports is re-checked against [`is_ignored`](Self::is_ignored).
    pub fn exclusion_globs(&self) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|p| !p.starts_with('!'))
            .map(|p| {
                let trimmed = p.trim_start_matches('/').trim_end_matches('/');
                format!("!{trimmed}")
            })
            .filter(|g| g.len() > 1)
            .collect()
    }
}

fn add_pattern(
    builder: &mut GitignoreBuilder,
    patterns: &mut Vec<String>,
    source: Option<&Path>,
    line: &str,
) {
    let trimmed = line.trim_end();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return;
    }
    match builder.add_line(source.map(Path::to_path_buf), trimmed) {
        Ok(_) => patterns.push(trimmed.to_string()),
        Err(e) => warn!(pattern = trimmed, error = %e, "Skipping malformed ignore pattern"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rules_with(content: &str) -> (TempDir, IgnoreRuleSet) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".gitignore"), content).unwrap();
        let rules = IgnoreRuleSet::load(tmp.path(), &[".gitignore".to_string()], &[]);
        (tmp, rules)
    }

    #[test]
    fn test_missing_ignore_file_uses_builtins() {
        let tmp = TempDir::new().unwrap();
        let rules = IgnoreRuleSet::load(tmp.path(), &[".gitignore".to_string()], &[]);

        assert!(rules.sources().is_empty());
        assert!(rules.is_ignored(Path::new("node_modules"), true));
        assert!(rules.is_ignored(Path::new("node_modules/x.js"), false));
        assert!(rules.is_ignored(Path::new("web/node_modules/lib/index.js"), false));
        assert!(rules.is_ignored(Path::new(".git/HEAD"), false));
        assert!(rules.is_ignored(Path::new(".DS_Store"), false));
        assert!(!rules.is_ignored(Path::new("src/main.rs"), false));
        assert!(!rules.is_ignored(Path::new("README.md"), false));
    }

    #[test]
    fn test_wildcard_and_double_star() {
        let (_tmp, rules) = rules_with("*.tmp\ndocs/**/draft.md\n");

        assert!(rules.is_ignored(Path::new("a.tmp"), false));
        assert!(rules.is_ignored(Path::new("deep/nested/b.tmp"), false));
        assert!(rules.is_ignored(Path::new("docs/draft.md"), false));
        assert!(rules.is_ignored(Path::new("docs/a/b/draft.md"), false));
        assert!(!rules.is_ignored(Path::new("docs/final.md"), false));
    }

    #[test]
    fn test_anchored_pattern() {
        let (_tmp, rules) = rules_with("/secret.txt\n");

        assert!(rules.is_ignored(Path::new("secret.txt"), false));
        assert!(!rules.is_ignored(Path::new("sub/secret.txt"), false));
    }

    #[test]
    fn test_directory_marker() {
        let (_tmp, rules) = rules_with("logs/\n");

        assert!(rules.is_ignored(Path::new("logs"), true));
        assert!(rules.is_ignored(Path::new("logs/today.txt"), false));
        assert!(!rules.is_ignored(Path::new("logs"), false));
    }

    #[test]
    fn test_negation() {
        let (_tmp, rules) = rules_with("*.tmp\n!keep.tmp\n");

        assert!(rules.is_ignored(Path::new("drop.tmp"), false));
        assert!(!rules.is_ignored(Path::new("keep.tmp"), false));
    }

    #[test]
    fn test_builtins_cannot_be_negated() {
        let (_tmp, rules) = rules_with("!node_modules/\n");
        assert!(rules.is_ignored(Path::new("node_modules/x.js"), false));
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let (_tmp, rules) = rules_with("# comment\n\n*.bak\n");

        assert_eq!(rules.patterns()[0], "*.bak");
        assert!(rules.is_ignored(Path::new("x.bak"), false));
    }

    #[test]
    fn test_malformed_pattern_skipped() {
        let (_tmp, rules) = rules_with("a[\n*.bak\n");

        assert!(!rules.patterns().iter().any(|p| p == "a["));
        assert!(rules.is_ignored(Path::new("x.bak"), false));
    }

    #[test]
    fn test_unreadable_ignore_file_degrades() {
        let tmp = TempDir::new().unwrap();
        // A directory where the ignore file should be cannot be read as text.
        std::fs::create_dir(tmp.path().join(".gitignore")).unwrap();
        let rules = IgnoreRuleSet::load(tmp.path(), &[".gitignore".to_string()], &[]);

        assert!(rules.sources().is_empty());
        assert!(rules.is_ignored(Path::new("target/debug/app"), false));
    }

    #[test]
    fn test_extra_patterns() {
        let tmp = TempDir::new().unwrap();
        let rules = IgnoreRuleSet::load(tmp.path(), &[], &["fixtures/".to_string()]);

        assert!(rules.is_ignored(Path::new("fixtures/big.json"), false));
    }

    #[test]
    fn test_absolute_path_under_root() {
        let (tmp, rules) = rules_with("*.tmp\n");
        assert!(rules.is_ignored(&tmp.path().join("a.tmp"), false));
        assert!(!rules.is_ignored(&tmp.path().join("a.txt"), false));
    }

    #[test]
    fn test_exclusion_globs() {
        let (_tmp, rules) = rules_with("/secret.txt\n!keep.tmp\nlogs/\n");
        let globs = rules.exclusion_globs();

        assert!(globs.contains(&"!secret.txt".to_string()));
        assert!(globs.contains(&"!logs".to_string()));
        assert!(globs.contains(&"!node_modules".to_string()));
        assert!(!globs.iter().any(|g| g.contains("keep.tmp")));
    }
}
