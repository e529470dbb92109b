//! Fuzz target for content extraction and token estimation.
//!
//! Run with: cargo +nightly fuzz run fuzz_extract
//!
//! The first two bytes pick a character budget; the rest is content. Every
//! policy must handle arbitrary UTF-8 without slicing inside a character, and
//! a sectional extract must never be longer than its input.

#![no_main]

use ctxpack_core::assembler::{ExtractContext, extract, sectional};
use ctxpack_core::{InjectionPolicy, estimate_tokens};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let max_chars = u16::from_le_bytes([data[0], data[1]]) as usize;
    let Ok(content) = std::str::from_utf8(&data[2..]) else {
        return;
    };

    let cut = sectional(content, max_chars);
    if content.chars().count() <= max_chars {
        assert_eq!(cut, content);
    }

    let keywords = vec!["fn".to_string(), "auth".to_string()];
    let ctx = ExtractContext {
        keywords: &keywords,
        context_lines: 2,
        minimal_lines: 5,
    };
    for policy in InjectionPolicy::ALL {
        let (out, _) = extract(policy, content, &ctx);
        let _ = estimate_tokens(&out);
    }
});
