use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::client::BotmonApi;
use crate::error::SessionError;
use crate::flows::{extract_flows, ExtractedFlows};
use crate::now_iso;
use crate::prompting::{
    render_no_history, render_welcome, CLEARED_TEXT, HISTORY_FAILED_TEXT, HISTORY_FAILED_TOAST,
    LOGIN_REQUIRED_TEXT,
};
use crate::resolver::{resolve_with_kind, MatchKind};
use crate::types::{
    ChatMessage, ConversationTurn, Direction, FlowEntry, FlowTable, MessageType, ReplySource,
    SendInput, SendOutcome, SessionSummary, TestChatMetadata, TestChatRequest,
};

/// Above this many non-greeting keys the menu is shown right after the welcome.
const MENU_AUTO_DISPLAY_THRESHOLD: usize = 6;
const MENU_KEYS: [&str; 3] = ["hello", "hi", "home"];
const PLATFORM: &str = "web";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Loading,
    Ready,
    Sending,
}

/// One interactive test session: the flow table and the append-only transcript.
#[derive(Debug)]
pub struct ChatSession {
    id: String,
    credentials: Credentials,
    state: SessionState,
    flows: FlowTable,
    menu: Option<ChatMessage>,
    transcript: Vec<ConversationTurn>,
    created_at: String,
    updated_at: String,
}

/// A send that passed the guard and is waiting for the remote answer.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub request: TestChatRequest,
    pub token: Option<String>,
    pub user_turn: Option<ConversationTurn>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, credentials: Credentials) -> Self {
        let now = now_iso();
        Self {
            id: id.into(),
            credentials,
            state: SessionState::Loading,
            flows: FlowTable::new(),
            menu: None,
            transcript: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn menu(&self) -> Option<&ChatMessage> {
        self.menu.as_ref()
    }

    pub fn transcript(&self) -> &[ConversationTurn] {
        &self.transcript
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            username: self.credentials.username.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            last_message: self.transcript.last().cloned(),
            message_count: self.transcript.len(),
            flow_count: self.flows.real_flow_count(),
        }
    }

    fn push(&mut self, turn: ConversationTurn) -> ConversationTurn {
        self.updated_at = turn.timestamp.clone();
        self.transcript.push(turn.clone());
        turn
    }

    fn render_bot(&self, entry: &FlowEntry) -> ConversationTurn {
        let mut turn = ConversationTurn::bot(entry);
        let vars = HashMap::from([("username", self.credentials.username.as_str())]);
        turn.message = interpolate_placeholders(&turn.message, &vars);
        turn
    }

    /// Installs extracted flows and greets the user.
    pub fn load_flows(&mut self, extracted: ExtractedFlows) -> Vec<ConversationTurn> {
        self.flows = extracted.table;
        self.menu = extracted.menu;
        self.state = SessionState::Ready;

        let mut added = vec![self.push(ConversationTurn::bot_text(render_welcome(
            &self.credentials.username,
        )))];

        let real_flows = self.flows.real_flow_count();
        if real_flows > MENU_AUTO_DISPLAY_THRESHOLD {
            let menu = MENU_KEYS
                .iter()
                .find_map(|key| self.flows.get(key))
                .cloned();
            match menu {
                Some(entry) => {
                    let turn = self.render_bot(&entry);
                    added.push(self.push(turn));
                }
                None => debug!("session {} has {real_flows} flows but no menu", self.id),
            }
        } else {
            added.push(self.push(ConversationTurn::bot_text(render_no_history(real_flows))));
        }
        added
    }

    pub fn load_failed(&mut self) -> ConversationTurn {
        self.flows = FlowTable::new();
        self.menu = None;
        self.state = SessionState::Ready;
        self.push(ConversationTurn::bot_text(HISTORY_FAILED_TEXT))
    }

    pub fn login_required(&mut self) -> ConversationTurn {
        self.state = SessionState::Ready;
        self.push(ConversationTurn::bot_text(LOGIN_REQUIRED_TEXT))
    }

    /// Guards against overlapping sends and appends the user's turn.
    pub fn begin_send(&mut self, input: &SendInput) -> Result<PendingSend, SessionError> {
        match self.state {
            SessionState::Loading => return Err(SessionError::Loading),
            SessionState::Sending => return Err(SessionError::Busy),
            SessionState::Ready => {}
        }
        let message = input.message().trim();
        if message.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (message_type, payload) = match input.payload() {
            Some(payload) => (MessageType::Button, Some(payload.trim().to_string())),
            None => (MessageType::Text, None),
        };
        let request = TestChatRequest {
            message: message.to_string(),
            username: self.credentials.username.clone(),
            message_type,
            metadata: TestChatMetadata {
                direction: Direction::Incoming,
                platform: PLATFORM.to_string(),
                payload,
            },
        };

        let display = input.display().trim();
        let user_turn = (!display.is_empty()).then(|| self.push(ConversationTurn::user(display)));
        self.state = SessionState::Sending;

        Ok(PendingSend {
            request,
            token: self.credentials.token().map(str::to_string),
            user_turn,
        })
    }

    /// Appends the bot turn: the remote reply when there is one, otherwise the
    /// locally resolved flow. The fallback echoes user input and is never
    /// interpolated.
    pub fn finish_send(&mut self, pending: PendingSend, remote: Option<FlowEntry>) -> SendOutcome {
        let (entry, source, kind) = match remote {
            Some(entry) => (Arc::new(entry), ReplySource::Remote, None),
            None => {
                let (entry, kind) = resolve_with_kind(&pending.request.message, &self.flows);
                debug!(
                    "session {} resolved {:?} locally ({kind:?})",
                    self.id, pending.request.message
                );
                (entry, ReplySource::Local, Some(kind))
            }
        };
        let turn = match kind {
            Some(MatchKind::Fallback) => ConversationTurn::bot(&entry),
            _ => self.render_bot(&entry),
        };
        let bot_turn = self.push(turn);
        self.state = SessionState::Ready;

        SendOutcome {
            user_turn: pending.user_turn,
            bot_turn,
            source,
        }
    }

    /// Leaves a stuck Loading or Sending state after its task died.
    pub fn recover(&mut self) {
        if self.state != SessionState::Ready {
            warn!("session {} recovered from {:?}", self.id, self.state);
            self.state = SessionState::Ready;
        }
    }

    /// Wipes the transcript; the flow table is kept.
    pub fn clear(&mut self) -> ConversationTurn {
        self.transcript.clear();
        self.push(ConversationTurn::bot_text(CLEARED_TEXT))
    }
}

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)\s*\}\}").ok());

/// Replaces `{{ name }}` with known values. Unknown placeholders are kept.
pub fn interpolate_placeholders(text: &str, vars: &HashMap<&str, &str>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let Some(re) = PLACEHOLDER.as_ref() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures| {
        vars.get(&caps[1])
            .map(|value| value.to_string())
            .unwrap_or_else(|| caps[0].to_string())
    })
    .to_string()
}

/// Observes what a session appends, e.g. to push it over a websocket.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn turn_added(&self, session_id: &str, turn: &ConversationTurn);

    async fn typing(&self, _session_id: &str, _active: bool) {}

    async fn toast(&self, _session_id: &str, _text: &str) {}
}

pub struct NoopListener;

#[async_trait]
impl SessionListener for NoopListener {
    async fn turn_added(&self, _session_id: &str, _turn: &ConversationTurn) {}
}

pub type SharedSession = Arc<Mutex<ChatSession>>;

/// Drives sessions against the remote API. The session lock is never held
/// across a network call, and the network part runs on its own task so a
/// dropped caller cannot leave a session Loading or Sending.
#[derive(Clone)]
pub struct SessionController {
    api: Arc<dyn BotmonApi>,
}

impl SessionController {
    pub fn new(api: Arc<dyn BotmonApi>) -> Self {
        Self { api }
    }

    pub async fn load(
        &self,
        session: SharedSession,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), SessionError> {
        let task = tokio::spawn(load_history(
            Arc::clone(&self.api),
            Arc::clone(&session),
            listener,
        ));
        join_session_task(task, &session).await
    }

    pub async fn send(
        &self,
        session: SharedSession,
        input: SendInput,
        listener: Arc<dyn SessionListener>,
    ) -> Result<SendOutcome, SessionError> {
        let (session_id, pending) = {
            let mut guard = session.lock().await;
            let pending = guard.begin_send(&input)?;
            (guard.id.clone(), pending)
        };

        let task = tokio::spawn(complete_send(
            Arc::clone(&self.api),
            Arc::clone(&session),
            session_id,
            pending,
            listener,
        ));
        join_session_task(task, &session).await
    }
}

async fn join_session_task<T>(
    task: tokio::task::JoinHandle<T>,
    session: &Mutex<ChatSession>,
) -> Result<T, SessionError> {
    match task.await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!("session task failed: {err}");
            session.lock().await.recover();
            Err(SessionError::Interrupted)
        }
    }
}

async fn load_history(
    api: Arc<dyn BotmonApi>,
    session: SharedSession,
    listener: Arc<dyn SessionListener>,
) {
    let (session_id, token) = {
        let guard = session.lock().await;
        (guard.id.clone(), guard.credentials.token().map(str::to_string))
    };

    let Some(token) = token else {
        info!("session {session_id} has no auth token, skipping history fetch");
        let turn = session.lock().await.login_required();
        listener.turn_added(&session_id, &turn).await;
        return;
    };

    info!("loading chat history for session {session_id}");
    let added = match api.fetch_chat_history(&token).await {
        Ok(data) => {
            let extracted = extract_flows(&data);
            session.lock().await.load_flows(extracted)
        }
        Err(err) => {
            warn!("chat history fetch failed for session {session_id}: {err}");
            listener.toast(&session_id, HISTORY_FAILED_TOAST).await;
            vec![session.lock().await.load_failed()]
        }
    };

    for turn in &added {
        listener.turn_added(&session_id, turn).await;
    }
}

async fn complete_send(
    api: Arc<dyn BotmonApi>,
    session: SharedSession,
    session_id: String,
    pending: PendingSend,
    listener: Arc<dyn SessionListener>,
) -> SendOutcome {
    if let Some(turn) = &pending.user_turn {
        listener.turn_added(&session_id, turn).await;
    }

    listener.typing(&session_id, true).await;
    let remote = ask_remote(api.as_ref(), &session_id, &pending).await;
    listener.typing(&session_id, false).await;

    let outcome = session.lock().await.finish_send(pending, remote);
    listener.turn_added(&session_id, &outcome.bot_turn).await;
    outcome
}

async fn ask_remote(
    api: &dyn BotmonApi,
    session_id: &str,
    pending: &PendingSend,
) -> Option<FlowEntry> {
    let Some(token) = pending.token.as_deref() else {
        debug!("session {session_id} has no auth token, resolving locally");
        return None;
    };
    match api.send_test_message(token, &pending.request).await {
        Ok(response) => {
            let reply = response.conclusive();
            if reply.is_none() {
                debug!("session {session_id}: remote had no answer, resolving locally");
            }
            reply
        }
        Err(err) => {
            warn!("test message failed for session {session_id}: {err}");
            None
        }
    }
}
