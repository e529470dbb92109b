#![deny(unsafe_code)]

//! Shared test utilities for the ctxpack workspace.
//!
//! Provides config builders, temporary project trees, and tracing helpers so
//! that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! ctxpack-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod project;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use project::TestProject;
pub use tracing_setup::init_test_tracing;
