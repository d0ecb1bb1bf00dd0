//! Token-budgeted context assembly.
//!
//! Turns a ranked chunk list into the text block injected into a prompt.
//! Chunks are always included whole. A chunk that does not fit the
//! remaining budget is skipped and the next (lower-ranked) one is tried.

use serde::Serialize;

use crate::models::ScoredChunk;
use crate::partition::PartitionRegistry;
use crate::ranking::parse_timestamp;

/// Fixed characters-per-token ratio used for every estimate.
pub const CHARS_PER_TOKEN: usize = 4;

const WRAPPER_OPEN: &str = "<retrieved_context>\n";
const WRAPPER_CLOSE: &str = "</retrieved_context>";

/// Assembled context block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBudget {
    /// Rendered, wrapper-delimited text. Empty when nothing fit.
    pub block: String,
    /// Included chunks in inclusion order.
    pub included: Vec<ScoredChunk>,
    /// Estimated tokens of the included chunks plus wrapper overhead.
    pub total_tokens: usize,
}

impl ContextBudget {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

/// Rough token estimate: `ceil(chars / CHARS_PER_TOKEN)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Tokens reserved for the structural wrapper.
pub fn wrapper_overhead() -> usize {
    estimate_tokens(WRAPPER_OPEN) + estimate_tokens(WRAPPER_CLOSE)
}

/// Render one chunk with its partition header.
pub fn render_chunk(chunk: &ScoredChunk, registry: &PartitionRegistry) -> String {
    let label = registry.label(&chunk.partition);
    let date = registry
        .get(&chunk.partition)
        .and_then(|p| p.timestamp(&chunk.metadata))
        .and_then(parse_timestamp)
        .map(|ts| ts.format("%Y-%m-%d").to_string());

    match date {
        Some(d) => format!("[{} · updated {}]\n{}\n\n", label, d, chunk.text.trim()),
        None => format!("[{}]\n{}\n\n", label, chunk.text.trim()),
    }
}

/// Select whole chunks, in the order given, until the budget is spent.
pub fn assemble(
    ranked: &[ScoredChunk],
    budget_tokens: usize,
    registry: &PartitionRegistry,
) -> ContextBudget {
    let overhead = wrapper_overhead();
    if budget_tokens <= overhead {
        return ContextBudget::default();
    }

    let mut remaining = budget_tokens - overhead;
    let mut body = String::new();
    let mut included = Vec::new();
    let mut used = 0usize;

    for chunk in ranked {
        let rendered = render_chunk(chunk, registry);
        let cost = estimate_tokens(&rendered);
        if cost > remaining {
            continue;
        }
        remaining -= cost;
        used += cost;
        body.push_str(&rendered);
        included.push(chunk.clone());
    }

    if included.is_empty() {
        return ContextBudget::default();
    }

    ContextBudget {
        block: format!("{}{}{}", WRAPPER_OPEN, body, WRAPPER_CLOSE),
        included,
        total_tokens: used + overhead,
    }
}
