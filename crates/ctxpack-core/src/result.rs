//! Collection results handed back to the caller.

use serde::{Deserialize, Serialize};

use crate::assembler::InjectionPolicy;
use crate::relevance::ScoreBreakdown;

/// One selected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// Full content, a policy extract, or a boundary summary.
    pub content: String,
    /// Relevance priority at selection time.
    pub priority: u32,
    /// Component breakdown of `priority`.
    pub score: ScoreBreakdown,
    /// Estimated token cost of `content`.
    pub tokens: u32,
    /// Whether `content` is shorter than the file.
    pub truncated: bool,
    /// Extraction that produced `content`.
    pub policy: InjectionPolicy,
}

/// Aggregate facts about one collection call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Distinct non-ignored files examined during traversal.
    pub files_scanned: usize,
    /// Files skipped for size, binary content, or read errors.
    pub excluded_count: usize,
    /// Sum of `tokens` over the selected files.
    pub total_tokens: u32,
    /// Budget the selection was made against.
    pub max_tokens: u32,
    /// Wall-clock time of the call that produced the files.
    pub elapsed_ms: u64,
    /// Whether keyword counts came from the external search tool.
    pub external_search_used: bool,
    /// Whether this result was served from the cache.
    pub cached: bool,
    /// Keywords derived from the query.
    pub keywords: Vec<String>,
}

/// The outcome of [`Collector::collect`](crate::Collector::collect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResult {
    /// The query as supplied by the caller.
    pub query: String,
    /// Selected files in priority order.
    pub files: Vec<CollectedFile>,
    pub metadata: CollectionMetadata,
}

impl CollectionResult {
    /// Paths of the selected files, in order.
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    /// Whether any selected file is truncated or summarized.
    pub fn any_truncated(&self) -> bool {
        self.files.iter().any(|f| f.truncated)
    }
}
