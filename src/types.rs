use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::now_iso;

/// Trigger keys every greeting resolves through. Never listed as suggestions
/// and never counted as real flows.
pub const GREETING_KEYS: [&str; 6] = ["hello", "hi", "start", "home", "menu", "main menu"];

pub fn is_greeting_key(key: &str) -> bool {
    GREETING_KEYS.contains(&key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "Value")]
pub enum Direction {
    Incoming,
    Outgoing,
    #[default]
    Unknown,
}

impl From<Value> for Direction {
    fn from(value: Value) -> Self {
        match value.as_str().map(str::trim) {
            Some(raw) if raw.eq_ignore_ascii_case("incoming") => Self::Incoming,
            Some(raw) if raw.eq_ignore_ascii_case("outgoing") => Self::Outgoing,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "Value")]
pub enum MessageType {
    #[default]
    Text,
    Button,
    List,
    Carousel,
}

impl From<Value> for MessageType {
    fn from(value: Value) -> Self {
        match value.as_str().map(str::trim) {
            Some(raw) if raw.eq_ignore_ascii_case("button") => Self::Button,
            Some(raw) if raw.eq_ignore_ascii_case("list") => Self::List,
            Some(raw) if raw.eq_ignore_ascii_case("carousel") => Self::Carousel,
            _ => Self::Text,
        }
    }
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Button => "button",
            Self::List => "list",
            Self::Carousel => "carousel",
        }
    }
}

/// One historical message as returned by the history endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, rename = "message_type")]
    pub message_type: MessageType,
    #[serde(default, deserialize_with = "lenient_text")]
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, deserialize_with = "lenient_text")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
}

/// Strings pass through, numbers and booleans are stringified, anything else is empty.
fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => String::new(),
    })
}

impl ChatMessage {
    pub fn metadata_text(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn metadata_elements(&self) -> &[Value] {
        self.metadata
            .get("elements")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// The `data` object of the history endpoint, keyed by platform/user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: IndexMap<String, Vec<ChatMessage>>,
}

/// A response template stored in the flow table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
}

pub fn empty_metadata() -> Value {
    Value::Object(Map::new())
}

impl FlowEntry {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_type: MessageType::Text,
            metadata: empty_metadata(),
        }
    }
}

impl From<&ChatMessage> for FlowEntry {
    fn from(source: &ChatMessage) -> Self {
        let metadata = if source.metadata.is_null() {
            empty_metadata()
        } else {
            source.metadata.clone()
        };
        Self {
            message: source.message.clone(),
            message_type: source.message_type,
            metadata,
        }
    }
}

/// Lower-cased trigger -> response. Several triggers may share one entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FlowTable {
    entries: IndexMap<String, Arc<FlowEntry>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, entry: Arc<FlowEntry>) {
        self.entries.insert(key, entry);
    }

    /// Inserts only when `key` is unused. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, key: &str, entry: &Arc<FlowEntry>) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), Arc::clone(entry));
        true
    }

    pub fn get(&self, key: &str) -> Option<&Arc<FlowEntry>> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<FlowEntry>)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys that are not canonical greetings.
    pub fn real_flow_count(&self) -> usize {
        self.keys().filter(|key| !is_greeting_key(key)).count()
    }
}

/// A single rendered exchange in the test transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: String,
    pub is_user: bool,
    pub message: String,
    #[serde(rename = "message_type")]
    pub message_type: MessageType,
    pub metadata: Value,
    pub timestamp: String,
}

impl ConversationTurn {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            is_user: true,
            message: message.into(),
            message_type: MessageType::Text,
            metadata: empty_metadata(),
            timestamp: now_iso(),
        }
    }

    pub fn bot_text(message: impl Into<String>) -> Self {
        Self::bot(&FlowEntry::text(message))
    }

    pub fn bot(entry: &FlowEntry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            is_user: false,
            message: entry.message.clone(),
            message_type: entry.message_type,
            metadata: entry.metadata.clone(),
            timestamp: now_iso(),
        }
    }
}

/// Body POSTed to the remote test-chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestChatRequest {
    pub message: String,
    pub username: String,
    pub message_type: MessageType,
    pub metadata: TestChatMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestChatMetadata {
    pub direction: Direction,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestChatResponse {
    #[serde(default)]
    pub response: Option<RemoteReply>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RemoteReply {
    Text(String),
    Structured(FlowEntry),
}

pub const NOTHING_PROCESSED: &str = "Nothing processed";

impl TestChatResponse {
    /// The remote answer, unless it is absent, blank or the "nothing processed" sentinel.
    pub fn conclusive(self) -> Option<FlowEntry> {
        let entry = match self.response? {
            RemoteReply::Text(text) => FlowEntry::text(text),
            RemoteReply::Structured(entry) => entry,
        };
        let text = entry.message.trim();
        if text.is_empty() || text == NOTHING_PROCESSED {
            return None;
        }
        Some(entry)
    }
}

/// What the user submitted: free text, or a structured button payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SendInput {
    Text(String),
    Button {
        payload: String,
        title: Option<String>,
    },
}

impl SendInput {
    /// The text sent upstream and resolved locally.
    pub fn message(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Button { payload, .. } => payload,
        }
    }

    /// The text shown as the user's turn.
    pub fn display(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Button { payload, title } => title
                .as_deref()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or(payload),
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Button { payload, .. } => Some(payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Remote,
    Local,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub user_turn: Option<ConversationTurn>,
    pub bot_turn: ConversationTurn,
    pub source: ReplySource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub username: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<ConversationTurn>,
    pub message_count: usize,
    pub flow_count: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonBody {
    pub payload: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
