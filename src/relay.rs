//! Context relay between consecutive workload units.
//!
//! After a unit completes, a handful of salient sentences ("insights") are
//! pulled out of its output and stored under the unit's identifier. The next
//! unit in the roster cycle picks them up via [`ContextRelay::transfer`].
//! Nothing is merged across non-adjacent units.

use crate::config::RelayConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Upper bound on insights carried per context.
pub const MAX_INSIGHTS: usize = 3;

/// Artifacts relayed from one execution to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub producer_id: String,
    pub insights: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(producer_id: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            insights: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Keyword filter over the leading sentences of `text`.
///
/// Deterministic for identical `(text, config)` and never returns more than
/// [`MAX_INSIGHTS`] entries.
pub fn extract_insights(text: &str, config: &RelayConfig) -> Vec<String> {
    let keywords: Vec<String> = config
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    let mut insights: Vec<String> = Vec::new();
    for sentence in split_sentences(text).into_iter().take(config.sentence_window) {
        if insights.len() >= MAX_INSIGHTS {
            break;
        }
        let lowered = sentence.to_lowercase();
        if !keywords.iter().any(|k| lowered.contains(k.as_str())) {
            continue;
        }
        let insight = truncate_chars(sentence, config.max_insight_chars);
        if !insight.is_empty() && !insights.contains(&insight) {
            insights.push(insight);
        }
    }
    insights
}

/// Split on `.`, `!` or `?` followed by whitespace (or end of text) and on
/// line breaks.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let end = match c {
            '\n' | '\r' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                None => Some(i + c.len_utf8()),
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                Some(_) => None,
            },
            _ => None,
        };
        if let Some(end) = end {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = if matches!(c, '\n' | '\r') { i + 1 } else { end };
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => s[..cut].trim_end().to_owned(),
        None => s.to_owned(),
    }
}

/// Latest context per producer.
#[derive(Debug, Default)]
pub struct ContextRelay {
    config: RelayConfig,
    contexts: HashMap<String, ExecutionContext>,
}

impl ContextRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            contexts: HashMap::new(),
        }
    }

    /// Derive and store the context for `producer_id`, replacing any earlier
    /// one from the same producer.
    pub fn extract(
        &mut self,
        producer_id: &str,
        raw_output: &str,
        metadata: BTreeMap<String, String>,
    ) -> ExecutionContext {
        let context = ExecutionContext {
            producer_id: producer_id.to_owned(),
            insights: extract_insights(raw_output, &self.config),
            metadata,
            created_at: Utc::now(),
        };
        debug!(
            unit = %producer_id,
            insights = context.insights.len(),
            "stored relay context"
        );
        self.contexts.insert(producer_id.to_owned(), context.clone());
        context
    }

    /// Context stored for `from_id`, handed to `to_id`.
    pub fn transfer(&self, from_id: &str, to_id: &str) -> Option<ExecutionContext> {
        let context = self.contexts.get(from_id).cloned();
        if let Some(context) = &context {
            debug!(
                from = %from_id,
                to = %to_id,
                insights = context.insights.len(),
                "relaying context"
            );
        }
        context
    }

    pub fn get(&self, producer_id: &str) -> Option<&ExecutionContext> {
        self.contexts.get(producer_id)
    }
}
