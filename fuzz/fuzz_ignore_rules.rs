//! Fuzz target for the ignore-rule compiler.
//!
//! Run with: cargo +nightly fuzz run fuzz_ignore_rules
//!
//! Lines before the first NUL byte are compiled as patterns, the remainder is
//! a path to classify. Malformed patterns must be skipped and built-in
//! defaults must keep applying.

#![no_main]

use std::path::Path;

use ctxpack_core::IgnoreRuleSet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (patterns, path) = text.split_once('\0').unwrap_or((text, "src/main.rs"));
    let extra: Vec<String> = patterns.lines().map(str::to_string).collect();

    let rules = IgnoreRuleSet::load(Path::new("/fuzz-root"), &[], &extra);
    let _ = rules.is_ignored(Path::new(path), false);
    let _ = rules.exclusion_globs();
    assert!(rules.is_ignored(Path::new("node_modules/x.js"), false));
});
