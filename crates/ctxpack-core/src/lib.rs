#![deny(unsafe_code)]

//! ctxpack core engine.
//!
//! Selects a relevance-ranked slice of a project's files under a hard token
//! budget. A call flows through the stages below, leaf-first:
//!
//! - [`exclusion`] compiles ignore rules and classifies paths.
//! - [`traversal`] gathers candidates from version-control recency and a
//!   pruned tree walk.
//! - [`relevance`] assigns additive priorities and ranks candidates.
//! - [`tokens`] approximates token cost.
//! - [`assembler`] greedily packs ranked files into the budget.
//! - [`cache`] memoizes whole results by a content-derived key.
//!
//! [`Collector`] ties them together behind one synchronous `collect` call.

/// Greedy budget assembly and injection policies.
pub mod assembler;
/// Build metadata (version, commit, profile).
pub mod build_info;
/// TTL- and size-bounded result cache with an on-disk mirror.
pub mod cache;
/// The collection entry point.
pub mod collector;
/// Ignore-file and built-in exclusion rules.
pub mod exclusion;
/// Subprocess execution with a deadline.
pub mod process;
/// Priority scoring and keyword match backends.
pub mod relevance;
/// Collection result types.
pub mod result;
/// Token cost estimation.
pub mod tokens;
/// Candidate discovery.
pub mod traversal;

pub use assembler::{Budget, InjectionPolicy};
pub use cache::{CacheKey, CacheStats, CapabilityFingerprint, ResultCache};
pub use collector::{CollectError, CollectOptions, Collector};
pub use exclusion::IgnoreRuleSet;
pub use relevance::{MatchBackend, ScoreBreakdown};
pub use result::{CollectedFile, CollectionMetadata, CollectionResult};
pub use tokens::{TokenEstimator, estimate_tokens};
pub use traversal::FileRecord;
