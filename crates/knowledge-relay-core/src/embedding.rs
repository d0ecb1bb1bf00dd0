//! Embedding provider trait and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements, a
//! deterministic offline [`HashEmbedder`], trucking shorthand expansion
//! applied before embedding, and cosine similarity.
//!
//! HTTP-backed providers (OpenAI, Voyage) live in the `knowledge-relay`
//! app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Trait for embedding providers.
///
/// Implementations must be `Send + Sync`; one instance is shared across
/// every concurrent request.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    match vectors.pop() {
        Some(v) if vectors.is_empty() => Ok(v),
        _ => bail!(
            "embedder '{}' returned {} vectors for 1 input",
            embedder.model_name(),
            vectors.len() + 1
        ),
    }
}

static ABBREVIATIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bOTR\b", "over the road"),
        (r"\bCDL-A\b", "CDL Class A"),
        (r"\bO/O\b", "owner operator"),
        (r"\bHH\b", "home daily"),
        (r"\bRgn\b", "regional"),
    ]
    .into_iter()
    .filter_map(|(pattern, expansion)| Regex::new(pattern).ok().map(|re| (re, expansion)))
    .collect()
});

/// Spell out common trucking shorthand (`OTR`, `CDL-A`, `O/O`, `HH`, `Rgn`)
/// so queries and stored chunks embed the same way whichever form they use.
/// Matching is case-sensitive and whole-word.
pub fn expand_abbreviations(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (re, expansion) in ABBREVIATIONS.iter() {
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, *expansion).into_owned());
        }
    }
    out
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets
/// with a sign bit, and the result is L2-normalized. Identical texts map to
/// identical vectors and texts sharing most tokens land close together,
/// which is enough for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
