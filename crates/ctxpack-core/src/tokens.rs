//! Approximate token costing.
//!
//! No tokenizer is involved: the estimate is characters divided by a fixed
//! ratio, plus surcharges for code-like and non-ASCII content. Every surcharge
//! is driven by counts that only grow as text is appended, so the estimate is
//! monotonic in length.

use ctxpack_config::TokenConfig;

/// Characters that mark structured source text.
const STRUCTURAL: &[char] = &['{', '}', '(', ')', '[', ']', ';', '=', '<', '>'];

/// Words that mark source text even without much punctuation.
const CODE_KEYWORDS: &[&str] = &[
    "fn", "def", "class", "return", "import", "from", "let", "const", "var", "pub", "function",
    "struct", "impl", "enum", "async", "await", "elif", "lambda", "package", "func", "self",
];

/// Structural density at which the full code multiplier applies.
const STRUCTURAL_RATIO: f64 = 0.04;
/// Structural-character equivalents credited per code keyword.
const KEYWORD_WEIGHT: usize = 3;

/// Token cost estimator.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
    code_multiplier: f64,
    non_ascii_multiplier: f64,
}

impl TokenEstimator {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            chars_per_token: config.chars_per_token,
            code_multiplier: config.code_multiplier,
            non_ascii_multiplier: config.non_ascii_multiplier,
        }
    }

    /// Estimated token cost of `text`.
    ///
    /// Non-ASCII characters cost `non_ascii_multiplier` times a baseline
    /// character. The code surcharge scales with the code signal (structural
    /// characters plus weighted keywords) and saturates at `code_multiplier`
    /// once the signal reaches [`STRUCTURAL_RATIO`] of the text.
    pub fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let mut chars = 0usize;
        let mut non_ascii = 0usize;
        let mut structural = 0usize;
        for c in text.chars() {
            chars += 1;
            if !c.is_ascii() {
                non_ascii += 1;
            } else if STRUCTURAL.contains(&c) {
                structural += 1;
            }
        }

        let signal = structural.saturating_add(code_keywords(text).saturating_mul(KEYWORD_WEIGHT));
        let code_chars = (signal as f64 / STRUCTURAL_RATIO).min(chars as f64);

        let weighted = chars as f64
            + non_ascii as f64 * (self.non_ascii_multiplier - 1.0)
            + code_chars * (self.code_multiplier - 1.0);
        (weighted / self.chars_per_token).ceil().min(u32::MAX as f64) as u32
    }

    /// Characters that fit in `tokens` at the baseline ratio.
    pub fn chars_for(&self, tokens: u32) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(&TokenConfig::default())
    }
}

/// Estimate with the default ratios.
pub fn estimate_tokens(text: &str) -> u32 {
    TokenEstimator::default().estimate(text)
}

/// Code keywords among whitespace-terminated words.
///
/// The trailing word is left out while it can still grow, so appending text
/// never turns a counted keyword into a non-keyword.
fn code_keywords(text: &str) -> usize {
    let complete = match text.rfind(char::is_whitespace) {
        Some(end) => &text[..end],
        None => return 0,
    };
    complete
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|word| CODE_KEYWORDS.contains(word))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROSE: &str = "The quick brown fox jumps over the lazy dog while the cat sleeps.";

    #[test]
    fn test_baseline_estimation() {
        // "hello world" = 11 chars ≈ 3 tokens
        assert_eq!(estimate_tokens("hello world"), 3);
        assert_eq!(estimate_tokens(""), 0);
        // 100 chars ≈ 25 tokens
        assert_eq!(estimate_tokens(&"x".repeat(100)), 25);
    }

    #[test]
    fn test_code_costs_more_than_prose() {
        let code = "fn main() { let v = vec![1, 2, 3]; println!(\"{:?}\", v); }";
        let prose: String = PROSE.chars().cycle().take(code.chars().count()).collect();

        assert!(estimate_tokens(code) > estimate_tokens(&prose));
    }

    #[test]
    fn test_dense_structure_applies_full_multiplier() {
        // 96 plain + 4 structural = 100 chars, signal at the saturation point.
        let text = format!("{}{{}}()", "a".repeat(96));
        assert_eq!(estimate_tokens(&text), 30);
    }

    #[test]
    fn test_keyword_dense_text_counts_as_code() {
        let python = "def load self path\n    return open path read\nimport os\nclass Loader pass\n";
        assert_eq!(code_keywords(python), 5);
        assert_eq!(code_keywords(PROSE), 0);

        let plain: String = "x".repeat(python.chars().count());
        assert!(estimate_tokens(python) > estimate_tokens(&plain));
    }

    #[test]
    fn test_trailing_word_is_not_counted_yet() {
        assert_eq!(code_keywords("fn"), 0);
        assert_eq!(code_keywords("let fn"), 1);
        assert_eq!(code_keywords("let fn "), 2);
    }

    #[test]
    fn test_non_ascii_costs_more() {
        let cjk = "日本語のテキスト".repeat(10);
        let ascii = "a".repeat(cjk.chars().count());

        assert_eq!(estimate_tokens(&ascii), 20);
        assert_eq!(estimate_tokens(&cjk), 30);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let accented = "é".repeat(8);
        assert_eq!(accented.len(), 16);
        // 8 chars / 4 = 2, scaled by the non-ASCII factor.
        assert_eq!(estimate_tokens(&accented), 3);
    }

    #[test]
    fn test_monotonic_in_length() {
        let estimator = TokenEstimator::default();
        for unit in [PROSE, "{ x = y; }", "ünïcödé ", "fn a() {} "] {
            let mut last = 0;
            let mut text = String::new();
            for _ in 0..200 {
                text.push_str(unit);
                let next = estimator.estimate(&text);
                assert!(next >= last, "estimate shrank for {unit:?}");
                last = next;
            }
        }
    }

    #[test]
    fn test_appending_plain_text_never_lowers_estimate() {
        // Diluting structural density below the saturation point must not
        // drop the code surcharge.
        let estimator = TokenEstimator::default();
        let mut text = format!("{}{{}}()", "a".repeat(96));
        let mut last = estimator.estimate(&text);
        for _ in 0..400 {
            text.push('a');
            let next = estimator.estimate(&text);
            assert!(next >= last, "estimate shrank: {last} -> {next}");
            last = next;
        }
    }

    #[test]
    fn test_monotonic_char_by_char_on_mixed_text() {
        let estimator = TokenEstimator::default();
        let source = "pub fn naïve(x: u32) -> u32 {\n    let y = x * 2; // 日本\n    y\n}\nreturn fnord selfish ";
        let mut last = 0;
        for (end, _) in source.char_indices().skip(1).chain([(source.len(), ' ')]) {
            let next = estimator.estimate(&source[..end]);
            assert!(next >= last, "estimate shrank at byte {end}: {last} -> {next}");
            last = next;
        }
    }

    #[test]
    fn test_stable() {
        let estimator = TokenEstimator::default();
        let text = "pub fn stable() -> u32 { 42 }";
        assert_eq!(estimator.estimate(text), estimator.estimate(text));
    }

    #[test]
    fn test_custom_ratio() {
        let estimator = TokenEstimator::new(&TokenConfig {
            chars_per_token: 2.0,
            ..TokenConfig::default()
        });
        assert_eq!(estimator.estimate("abcdefgh"), 4);
        assert_eq!(estimator.chars_for(10), 20);
    }
}
