use std::sync::Arc;

use tracing::debug;

use crate::prompting::{render_fallback_response, FallbackResponseContext};
use crate::types::{is_greeting_key, FlowEntry, FlowTable};

const GREETING_WORDS: [&str; 6] = ["hello", "hi", "hey", "start", "home", "menu"];
const GREETING_TARGETS: [&str; 4] = ["hello", "hi", "home", "menu"];
const PRODUCT_TARGETS: [&str; 2] = ["general_product", "view products"];
const MAX_SUGGESTIONS: usize = 10;

/// Which rule produced a resolved entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Substring,
    Greeting,
    Product,
    Fallback,
}

/// Finds the response for `input`. Never fails: unmatched input gets a
/// generated entry listing the available triggers.
pub fn resolve_response(input: &str, table: &FlowTable) -> Arc<FlowEntry> {
    resolve_with_kind(input, table).0
}

pub fn resolve_with_kind(input: &str, table: &FlowTable) -> (Arc<FlowEntry>, MatchKind) {
    let needle = input.trim().to_lowercase();

    if let Some(entry) = table.get(&needle) {
        return (Arc::clone(entry), MatchKind::Exact);
    }

    // first hit in table order, not the longest
    if let Some((key, entry)) = table
        .iter()
        .find(|(key, _)| key.contains(needle.as_str()) || needle.contains(key))
    {
        debug!("resolved {needle:?} by substring of {key:?}");
        return (Arc::clone(entry), MatchKind::Substring);
    }

    let greeting = GREETING_WORDS
        .iter()
        .any(|word| needle.contains(word) || word.contains(needle.as_str()));
    if greeting {
        if let Some(entry) = first_present(table, &GREETING_TARGETS) {
            return (entry, MatchKind::Greeting);
        }
    }

    if needle.contains("product") {
        if let Some(entry) = first_present(table, &PRODUCT_TARGETS) {
            return (entry, MatchKind::Product);
        }
    }

    (Arc::new(fallback_entry(input, table)), MatchKind::Fallback)
}

fn first_present(table: &FlowTable, keys: &[&str]) -> Option<Arc<FlowEntry>> {
    keys.iter().find_map(|key| table.get(key)).map(Arc::clone)
}

fn fallback_entry(input: &str, table: &FlowTable) -> FlowEntry {
    let suggestions = table
        .keys()
        .filter(|key| !is_greeting_key(key))
        .take(MAX_SUGGESTIONS)
        .map(suggestion_label)
        .collect::<Vec<_>>();
    FlowEntry::text(render_fallback_response(&FallbackResponseContext {
        input,
        suggestions: &suggestions,
    }))
}

/// `general_product` -> `General Product`.
pub fn suggestion_label(key: &str) -> String {
    key.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
