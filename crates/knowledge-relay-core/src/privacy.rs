//! PII scrubbing and chunk text validation for ingestion.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Default ceiling on ingested chunk length, in characters.
pub const MAX_CHUNK_CHARS: usize = 8000;

macro_rules! pii_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

pii_pattern!(RE_SSN, r"\b\d{3}[-.]?\d{2}[-.]?\d{4}\b");
pii_pattern!(
    RE_EMAIL,
    r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"
);
pii_pattern!(
    RE_PHONE,
    r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"
);
// Commercial driver's licence numbers: one letter then nine digits.
pii_pattern!(RE_LICENCE, r"(?i)\b[A-Z]\d{3}[-\s]?\d{2}[-\s]?\d{4}\b");

/// Replace detectable personally-identifying substrings with placeholders.
///
/// Patterns run in order, so earlier ones win on overlapping spans.
pub fn scrub_pii(text: &str) -> String {
    let patterns: [(&Option<Regex>, &str); 4] = [
        (&*RE_SSN, "[SSN]"),
        (&*RE_EMAIL, "[EMAIL]"),
        (&*RE_PHONE, "[PHONE]"),
        (&*RE_LICENCE, "[CDL_NUM]"),
    ];
    let mut out = text.to_string();
    for (re, placeholder) in patterns {
        if let Some(re) = re {
            out = re.replace_all(&out, placeholder).into_owned();
        }
    }
    out
}

/// Trim and bound-check chunk text before it is embedded and stored.
pub fn validate_chunk_text(text: &str, max_chars: usize) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("text must not be empty");
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        bail!("text is {} characters, limit is {}", len, max_chars);
    }
    Ok(trimmed)
}
