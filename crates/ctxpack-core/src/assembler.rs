//! Budget assembly: greedy packing of ranked candidates into a token budget.
//!
//! Candidates arrive already ranked. Each one is read (bounded), reduced by the
//! active [`InjectionPolicy`], costed, and accepted while it fits. The first
//! candidate that does not fit ends the pass; if enough budget remains it is
//! included as a sectional summary sized to the remainder.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ctxpack_config::CollectorConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::result::CollectedFile;
use crate::tokens::TokenEstimator;
use crate::traversal::FileRecord;

/// Characters per file kept by the sectional policy.
pub const SECTIONAL_CHARS: usize = 6000;

/// Room reserved for each omission marker inside a sectional extract.
const MARKER_RESERVE: usize = 40;

/// Shrink factor applied to a summary that still overflows, as a fraction.
const SHRINK_NUM: usize = 4;
const SHRINK_DEN: usize = 5;

/// How much of each selected file is injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPolicy {
    /// Whole file.
    #[default]
    Full,
    /// Lines that mention a keyword, with surrounding context.
    Selective,
    /// Head, middle and tail sections.
    Sectional,
    /// The opening lines only.
    Minimal,
}

impl InjectionPolicy {
    pub const ALL: [InjectionPolicy; 4] = [
        InjectionPolicy::Full,
        InjectionPolicy::Selective,
        InjectionPolicy::Sectional,
        InjectionPolicy::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionPolicy::Full => "full",
            InjectionPolicy::Selective => "selective",
            InjectionPolicy::Sectional => "sectional",
            InjectionPolicy::Minimal => "minimal",
        }
    }
}

impl fmt::Display for InjectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown injection policy '{0}' (expected full, selective, sectional, or minimal)")]
pub struct UnknownPolicy(pub String);

impl FromStr for InjectionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InjectionPolicy::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPolicy(s.to_string()))
    }
}

/// Inputs the policy extractors need besides the content.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub keywords: &'a [String],
    pub context_lines: usize,
    pub minimal_lines: usize,
}

/// Reduce `content` according to `policy`. Returns the extract and whether it
/// dropped anything.
pub fn extract(policy: InjectionPolicy, content: &str, ctx: &ExtractContext<'_>) -> (String, bool) {
    let extracted = match policy {
        InjectionPolicy::Full => return (content.to_string(), false),
        InjectionPolicy::Selective => extract_selective(content, ctx),
        InjectionPolicy::Sectional => sectional(content, SECTIONAL_CHARS),
        InjectionPolicy::Minimal => head_lines(content, ctx.minimal_lines),
    };
    let shortened = extracted.len() < content.len();
    (extracted, shortened)
}

/// Keyword-bearing lines plus `context_lines` either side, merged into runs.
/// Falls back to the opening lines when nothing matches.
fn extract_selective(content: &str, ctx: &ExtractContext<'_>) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let hits: Vec<usize> = if ctx.keywords.is_empty() {
        Vec::new()
    } else {
        lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                let lowered = line.to_lowercase();
                ctx.keywords.iter().any(|k| lowered.contains(k.as_str()))
            })
            .map(|(i, _)| i)
            .collect()
    };
    if hits.is_empty() {
        return head_lines(content, ctx.minimal_lines);
    }

    let mut runs: Vec<(usize, usize)> = Vec::new();
    for hit in hits {
        let start = hit.saturating_sub(ctx.context_lines);
        let end = (hit + ctx.context_lines + 1).min(lines.len());
        match runs.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => runs.push((start, end)),
        }
    }

    let mut out = String::new();
    let mut cursor = 0;
    for (start, end) in runs {
        if start > cursor {
            out.push_str(&format!("[... {} lines omitted ...]\n", start - cursor));
        }
        for line in &lines[start..end] {
            out.push_str(line);
            out.push('\n');
        }
        cursor = end;
    }
    if cursor < lines.len() {
        out.push_str(&format!("[... {} lines omitted ...]\n", lines.len() - cursor));
    }
    out
}

/// The first `n` lines, with a marker when more follow.
fn head_lines(content: &str, n: usize) -> String {
    let total = content.lines().count();
    if total <= n {
        return content.to_string();
    }
    let mut out: String = content.lines().take(n).flat_map(|l| [l, "\n"]).collect();
    out.push_str(&format!("[... {} lines omitted ...]\n", total - n));
    out
}

/// Head (half), middle (quarter) and tail (quarter) of `content` in roughly
/// `max_chars` characters. Content that already fits is returned unchanged.
/// Cuts always fall on character boundaries.
pub fn sectional(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }

    let body = max_chars.saturating_sub(2 * MARKER_RESERVE);
    let head_len = body / 2;
    let mid_len = body / 4;
    let tail_len = body - head_len - mid_len;
    let tail_start = total - tail_len;
    let mid_start = (total / 2)
        .saturating_sub(mid_len / 2)
        .clamp(head_len, tail_start - mid_len);
    let mid_end = mid_start + mid_len;

    let byte_at = |i: usize| {
        content
            .char_indices()
            .nth(i)
            .map(|(b, _)| b)
            .unwrap_or(content.len())
    };
    let (head_end, mid_from, mid_to, tail_from) =
        (byte_at(head_len), byte_at(mid_start), byte_at(mid_end), byte_at(tail_start));

    format!(
        "{}{}{}{}{}",
        &content[..head_end],
        omission(mid_start - head_len),
        &content[mid_from..mid_to],
        omission(tail_start - mid_end),
        &content[tail_from..],
    )
}

fn omission(chars: usize) -> String {
    format!("\n\n[... {chars} characters omitted ...]\n\n")
}

/// Knobs for assembly.
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    /// Bytes read from any one file.
    pub max_read_bytes: u64,
    /// Smallest remainder worth spending on a boundary summary.
    pub min_summary_tokens: u32,
    pub selective_context_lines: usize,
    pub minimal_lines: usize,
}

impl From<&CollectorConfig> for AssemblerSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_read_bytes: config.max_file_bytes,
            min_summary_tokens: config.min_summary_tokens,
            selective_context_lines: config.selective_context_lines,
            minimal_lines: config.minimal_lines,
        }
    }
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self::from(&CollectorConfig::default())
    }
}

/// Per-call limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_tokens: u32,
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
}

impl Budget {
    pub fn tokens(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            max_files: None,
            max_total_bytes: None,
        }
    }
}

/// Running totals against a [`Budget`].
#[derive(Debug)]
struct Usage {
    budget: Budget,
    tokens: u32,
    bytes: u64,
    files: usize,
}

impl Usage {
    fn remaining_tokens(&self) -> u32 {
        self.budget.max_tokens.saturating_sub(self.tokens)
    }

    fn remaining_bytes(&self) -> Option<u64> {
        self.budget
            .max_total_bytes
            .map(|max| max.saturating_sub(self.bytes))
    }

    fn file_slots_left(&self) -> bool {
        self.budget.max_files.is_none_or(|max| self.files < max)
    }

    fn fits(&self, tokens: u32, bytes: u64) -> bool {
        tokens <= self.remaining_tokens() && self.remaining_bytes().is_none_or(|left| bytes <= left)
    }

    fn spend(&mut self, tokens: u32, bytes: u64) {
        self.tokens += tokens;
        self.bytes += bytes;
        self.files += 1;
    }
}

/// Output of one assembly pass.
#[derive(Debug, Default)]
pub struct Assembly {
    pub files: Vec<CollectedFile>,
    pub total_tokens: u32,
    /// Candidates skipped because they could not be read.
    pub read_failures: usize,
}

/// Packs ranked candidates into a budget.
#[derive(Debug, Clone)]
pub struct BudgetAssembler {
    root: PathBuf,
    estimator: TokenEstimator,
    settings: AssemblerSettings,
}

impl BudgetAssembler {
    pub fn new(root: impl Into<PathBuf>, estimator: TokenEstimator, settings: AssemblerSettings) -> Self {
        Self {
            root: root.into(),
            estimator,
            settings,
        }
    }

    /// Greedily accept `records` in order until the budget is spent.
    pub fn assemble(
        &self,
        records: &[FileRecord],
        budget: Budget,
        policy: InjectionPolicy,
        keywords: &[String],
    ) -> Assembly {
        let ctx = ExtractContext {
            keywords,
            context_lines: self.settings.selective_context_lines,
            minimal_lines: self.settings.minimal_lines,
        };
        let mut usage = Usage {
            budget,
            tokens: 0,
            bytes: 0,
            files: 0,
        };
        let mut assembly = Assembly::default();

        for record in records {
            if !usage.file_slots_left() {
                debug!(max_files = ?budget.max_files, "File limit reached");
                break;
            }

            let (raw, read_truncated) =
                match read_bounded(&self.root.join(&record.path), self.settings.max_read_bytes) {
                    Ok(read) => read,
                    Err(e) => {
                        debug!(path = %record.path, error = %e, "Skipping unreadable candidate");
                        assembly.read_failures += 1;
                        continue;
                    }
                };
            let (content, shortened) = extract(policy, &raw, &ctx);
            let tokens = self.estimator.estimate(&content);
            let bytes = content.len() as u64;

            if usage.fits(tokens, bytes) {
                usage.spend(tokens, bytes);
                assembly.files.push(CollectedFile {
                    path: record.path.clone(),
                    content,
                    priority: record.priority,
                    score: record.score,
                    tokens,
                    truncated: read_truncated || shortened,
                    policy,
                });
                continue;
            }

            let remaining = usage.remaining_tokens();
            if remaining >= self.settings.min_summary_tokens
                && let Some(summary) = self.summarize(&content, remaining, usage.remaining_bytes())
            {
                let tokens = self.estimator.estimate(&summary);
                usage.spend(tokens, summary.len() as u64);
                debug!(path = %record.path, tokens, remaining, "Boundary summary");
                assembly.files.push(CollectedFile {
                    path: record.path.clone(),
                    content: summary,
                    priority: record.priority,
                    score: record.score,
                    tokens,
                    truncated: true,
                    policy: InjectionPolicy::Sectional,
                });
            } else {
                debug!(path = %record.path, tokens, remaining, "Budget exhausted");
            }
            break;
        }

        assembly.total_tokens = usage.tokens;
        info!(
            files = assembly.files.len(),
            tokens = assembly.total_tokens,
            max_tokens = budget.max_tokens,
            policy = %policy,
            "Assembly complete"
        );
        assembly
    }

    /// A sectional summary of `content` that fits both remainders, if one exists.
    fn summarize(&self, content: &str, tokens: u32, bytes: Option<u64>) -> Option<String> {
        let mut max_chars = self.estimator.chars_for(tokens);
        if let Some(bytes) = bytes {
            max_chars = max_chars.min(usize::try_from(bytes).unwrap_or(usize::MAX));
        }
        while max_chars > 2 * MARKER_RESERVE {
            let summary = sectional(content, max_chars);
            let fits_tokens = self.estimator.estimate(&summary) <= tokens;
            let fits_bytes = bytes.is_none_or(|b| summary.len() as u64 <= b);
            if fits_tokens && fits_bytes {
                return Some(summary);
            }
            max_chars = max_chars * SHRINK_NUM / SHRINK_DEN;
        }
        None
    }
}

/// Read at most `cap` bytes of `path`, appending a marker if the file is longer.
fn read_bounded(path: &Path, cap: u64) -> std::io::Result<(String, bool)> {
    let mut buf = Vec::new();
    File::open(path)?.take(cap.saturating_add(1)).read_to_end(&mut buf)?;
    let truncated = buf.len() as u64 > cap;
    if truncated {
        buf.truncate(cap as usize);
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(&format!("\n[... truncated at {cap} bytes ...]\n"));
    }
    Ok((text, truncated))
}
