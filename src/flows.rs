use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::prompting::{menu_button_text, render_feature_in_development};
use crate::types::{
    ChatHistory, ChatMessage, Direction, FlowEntry, FlowTable, MessageType, GREETING_KEYS,
};

const MAIN_MENU_MARKER: &str = "Main Menu";

/// Where the entries of an extracted flow table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSource {
    /// Observed incoming -> outgoing pairs.
    Observed,
    /// Synthesized from the buttons of the main menu.
    Menu,
    Empty,
}

#[derive(Debug, Clone)]
pub struct ExtractedFlows {
    pub table: FlowTable,
    pub menu: Option<ChatMessage>,
    pub source: FlowSource,
    pub pair_count: usize,
}

impl ExtractedFlows {
    fn empty() -> Self {
        Self {
            table: FlowTable::new(),
            menu: None,
            source: FlowSource::Empty,
            pair_count: 0,
        }
    }
}

/// Builds the flow table from the `data` object of the history endpoint.
/// Malformed shapes produce an empty table.
pub fn extract_flows(data: &Value) -> ExtractedFlows {
    let Some(history) = parse_history(data) else {
        return ExtractedFlows::empty();
    };
    extract_from_history(&history)
}

/// Only the envelope shape can reject the history. A message that does not
/// parse is skipped on its own.
fn parse_history(data: &Value) -> Option<ChatHistory> {
    let Some(messages) = data.get("messages").and_then(Value::as_object) else {
        debug!("chat history has no messages object");
        return None;
    };

    let mut history = ChatHistory::default();
    for (user_key, list) in messages {
        let Some(list) = list.as_array() else {
            warn!("chat history for {user_key} is not a list");
            return None;
        };
        let parsed = list
            .iter()
            .enumerate()
            .filter_map(
                |(index, raw)| match serde_json::from_value::<ChatMessage>(raw.clone()) {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!("skipping message {index} of {user_key}: {err}");
                        None
                    }
                },
            )
            .collect();
        history.messages.insert(user_key.clone(), parsed);
    }
    Some(history)
}

pub fn extract_from_history(history: &ChatHistory) -> ExtractedFlows {
    let mut flattened = flatten(history);
    let menu = find_main_menu(&flattened).cloned();

    // stable, so messages sharing a timestamp keep their original order
    flattened.sort_by_key(|message| parse_timestamp(&message.timestamp));

    let mut table = FlowTable::new();
    let pair_count = collect_pairs(&flattened, &mut table);

    let source = match (&menu, pair_count) {
        (Some(menu), 0) => {
            synthesize_menu_flows(menu, &mut table);
            FlowSource::Menu
        }
        (Some(menu), _) => {
            let entry = Arc::new(FlowEntry::from(menu));
            for key in GREETING_KEYS {
                table.insert_if_absent(key, &entry);
            }
            FlowSource::Observed
        }
        (None, 0) => FlowSource::Empty,
        (None, _) => FlowSource::Observed,
    };

    info!(
        "extracted {} flow keys from {} messages ({} pairs, source {:?}, menu {})",
        table.len(),
        flattened.len(),
        pair_count,
        source,
        menu.is_some()
    );

    ExtractedFlows {
        table,
        menu,
        source,
        pair_count,
    }
}

fn flatten(history: &ChatHistory) -> Vec<ChatMessage> {
    history
        .messages
        .iter()
        .flat_map(|(user_key, messages)| {
            messages.iter().map(move |message| ChatMessage {
                user_key: Some(user_key.clone()),
                ..message.clone()
            })
        })
        .collect()
}

/// Last match wins.
fn find_main_menu(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rfind(|message| {
        message.message_type == MessageType::List
            && !message.metadata_elements().is_empty()
            && message.message.contains(MAIN_MENU_MARKER)
    })
}

/// Unparseable timestamps sort before every dated message.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn collect_pairs(messages: &[ChatMessage], table: &mut FlowTable) -> usize {
    let mut pairs = 0;
    for window in messages.windows(2) {
        let (current, next) = (&window[0], &window[1]);
        if current.direction != Direction::Incoming || next.direction != Direction::Outgoing {
            continue;
        }

        let trigger = current
            .metadata_text("payload")
            .or_else(|| Some(current.message.as_str()).filter(|text| !text.is_empty()));
        let Some(trigger) = trigger else {
            continue;
        };

        let entry = Arc::new(FlowEntry::from(next));
        table.insert(trigger.to_lowercase(), Arc::clone(&entry));
        if let Some(title) = current.metadata_text("title") {
            table.insert(title.to_lowercase(), entry);
        }
        pairs += 1;
    }
    pairs
}

fn synthesize_menu_flows(menu: &ChatMessage, table: &mut FlowTable) {
    for button in menu_buttons(menu) {
        let payload = button
            .get("payload")
            .and_then(Value::as_str)
            .filter(|payload| !payload.is_empty());
        let Some(payload) = payload else {
            continue;
        };
        let title = button
            .get("title")
            .and_then(Value::as_str)
            .filter(|title| !title.is_empty());

        let key = payload.to_lowercase();
        let message = match menu_button_text(&key) {
            Some(text) => text.to_string(),
            None => render_feature_in_development(title.unwrap_or(payload)),
        };
        let entry = Arc::new(FlowEntry::text(message));
        table.insert(key, Arc::clone(&entry));
        if let Some(title) = title {
            table.insert(title.to_lowercase(), entry);
        }
    }

    let menu_entry = Arc::new(FlowEntry::from(menu));
    for key in GREETING_KEYS {
        table.insert(key.to_string(), Arc::clone(&menu_entry));
    }
}

fn menu_buttons(menu: &ChatMessage) -> impl Iterator<Item = &Value> {
    menu.metadata_elements().iter().flat_map(|element| {
        element
            .get("buttons")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    })
}
