use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Credentials;
use crate::client::{BotmonApi, HttpBotmonApi};
use crate::config::Config;
use crate::error::{ApiError, HttpError};
use crate::now_iso;
use crate::session::{ChatSession, SessionController, SessionListener, SharedSession};
use crate::types::{
    ButtonBody, ConversationTurn, CreateSessionBody, EventEnvelopeIn, SendInput, SendMessageBody,
    SendOutcome, SessionSummary,
};

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    session_watchers: HashMap<String, HashSet<usize>>,
    watched_session: HashMap<usize, String>,
}

pub struct AppState {
    sessions: RwLock<HashMap<String, SharedSession>>,
    realtime: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
    controller: SessionController,
    config: Config,
}

impl AppState {
    pub fn new(config: Config, api: Arc<dyn BotmonApi>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            controller: SessionController::new(api),
            config,
        })
    }
}

/// State wired to the real Botmon API.
pub fn build_state(config: Config) -> Result<Arc<AppState>, ApiError> {
    let api = HttpBotmonApi::new(&config)?;
    Ok(AppState::new(config, Arc::new(api)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session", post(post_session))
        .route("/api/sessions", get(get_sessions))
        .route("/api/session/{session_id}", delete(delete_session))
        .route("/api/session/{session_id}/messages", get(get_messages))
        .route("/api/session/{session_id}/message", post(post_message))
        .route("/api/session/{session_id}/button", post(post_button))
        .route("/api/session/{session_id}/clear", post(post_clear))
        .route("/api/session/{session_id}/flows", get(get_flows))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(state: &AppState, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_watchers<T: Serialize>(state: &AppState, session_id: &str, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        rt.session_watchers
            .get(session_id)
            .map(|watchers| {
                watchers
                    .iter()
                    .filter_map(|id| rt.clients.get(id).cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

/// Pushes session activity to every websocket watching the session.
struct WatcherListener(Arc<AppState>);

#[async_trait]
impl SessionListener for WatcherListener {
    async fn turn_added(&self, session_id: &str, turn: &ConversationTurn) {
        emit_to_watchers(
            &self.0,
            session_id,
            "message:new",
            json!({ "sessionId": session_id, "message": turn }),
        )
        .await;
    }

    async fn typing(&self, session_id: &str, active: bool) {
        emit_to_watchers(
            &self.0,
            session_id,
            "typing",
            json!({ "sessionId": session_id, "sender": "bot", "active": active }),
        )
        .await;
    }

    async fn toast(&self, session_id: &str, text: &str) {
        emit_to_watchers(
            &self.0,
            session_id,
            "toast",
            json!({ "sessionId": session_id, "text": text }),
        )
        .await;
    }
}

fn watcher_listener(state: &Arc<AppState>) -> Arc<dyn SessionListener> {
    Arc::new(WatcherListener(Arc::clone(state)))
}

async fn find_session(state: &AppState, session_id: &str) -> Option<SharedSession> {
    state.sessions.read().await.get(session_id).cloned()
}

async fn require_session(state: &AppState, session_id: &str) -> Result<SharedSession, HttpError> {
    find_session(state, session_id)
        .await
        .ok_or_else(|| HttpError::NotFound(format!("session {session_id} not found")))
}

async fn session_summaries(state: &AppState) -> Vec<SessionSummary> {
    let sessions = {
        let sessions = state.sessions.read().await;
        sessions.values().cloned().collect::<Vec<_>>()
    };

    let mut list = Vec::with_capacity(sessions.len());
    for session in sessions {
        list.push(session.lock().await.summary());
    }
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    list
}

async fn send_and_report(
    state: Arc<AppState>,
    session: SharedSession,
    input: SendInput,
) -> Result<SendOutcome, HttpError> {
    let outcome = state
        .controller
        .send(session, input, watcher_listener(&state))
        .await?;
    Ok(outcome)
}

async fn clear_session(
    state: &AppState,
    session_id: &str,
    session: &SharedSession,
) -> Vec<ConversationTurn> {
    let messages = {
        let mut guard = session.lock().await;
        guard.clear();
        guard.transcript().to_vec()
    };
    info!("cleared transcript of session {session_id}");
    emit_to_watchers(
        state,
        session_id,
        "session:cleared",
        json!({ "sessionId": session_id, "messages": &messages }),
    )
    .await;
    messages
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let body: CreateSessionBody = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| HttpError::BadRequest(format!("invalid session body: {err}")))?
    };
    let credentials = Credentials::resolve(&state.config, body.username, body.token);
    let session_id = Uuid::new_v4().to_string();
    let session = Arc::new(Mutex::new(ChatSession::new(&session_id, credentials)));

    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), session.clone());
    info!("created test session {session_id}");

    state
        .controller
        .load(session.clone(), watcher_listener(&state))
        .await?;

    let messages = session.lock().await.transcript().to_vec();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "sessionId": session_id, "messages": messages })),
    ))
}

async fn get_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "sessions": session_summaries(&state).await }))
}

async fn delete_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    if state.sessions.write().await.remove(&session_id).is_none() {
        return Err(HttpError::NotFound(format!("session {session_id} not found")));
    }
    emit_to_watchers(
        &state,
        &session_id,
        "session:closed",
        json!({ "sessionId": session_id }),
    )
    .await;

    {
        let mut rt = state.realtime.lock().await;
        if let Some(watchers) = rt.session_watchers.remove(&session_id) {
            for client_id in watchers {
                rt.watched_session.remove(&client_id);
            }
        }
    }
    info!("deleted test session {session_id}");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &session_id).await?;
    let messages = session.lock().await.transcript().to_vec();
    Ok(Json(json!({ "messages": messages })))
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &session_id).await?;
    let outcome = send_and_report(state, session, SendInput::Text(body.text)).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn post_button(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ButtonBody>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &session_id).await?;
    let input = SendInput::Button {
        payload: body.payload,
        title: body.title,
    };
    let outcome = send_and_report(state, session, input).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn post_clear(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &session_id).await?;
    let messages = clear_session(&state, &session_id, &session).await;
    Ok(Json(json!({ "messages": messages })))
}

async fn get_flows(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &session_id).await?;
    let guard = session.lock().await;
    Ok(Json(json!({
        "flows": guard.flows(),
        "menu": guard.menu(),
        "realFlowCount": guard.flows().real_flow_count(),
    })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn data_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Detaches a client from the session it watches, dropping emptied watcher sets.
fn unwatch(rt: &mut RealtimeState, client_id: usize) {
    let Some(previous) = rt.watched_session.remove(&client_id) else {
        return;
    };
    if let Some(set) = rt.session_watchers.get_mut(&previous) {
        set.remove(&client_id);
        if set.is_empty() {
            rt.session_watchers.remove(&previous);
        }
    }
}

async fn watch_session(state: &AppState, client_id: usize, session_id: &str) {
    let mut rt = state.realtime.lock().await;
    unwatch(&mut rt, client_id);
    rt.watched_session.insert(client_id, session_id.to_string());
    rt.session_watchers
        .entry(session_id.to_string())
        .or_default()
        .insert(client_id);
}

async fn emit_unknown_session(state: &AppState, client_id: usize, session_id: &str) {
    emit_to_client(
        state,
        client_id,
        "error",
        json!({ "sessionId": session_id, "message": format!("session {session_id} not found") }),
    )
    .await;
}

/// Sends on a separate task so a slow remote reply never stalls the socket.
fn spawn_send(state: Arc<AppState>, client_id: usize, session_id: String, input: SendInput) {
    tokio::spawn(async move {
        let Some(session) = find_session(&state, &session_id).await else {
            emit_unknown_session(&state, client_id, &session_id).await;
            return;
        };
        let listener = watcher_listener(&state);
        if let Err(err) = state.controller.send(session, input, listener).await {
            debug!("ws send rejected for session {session_id}: {err}");
            emit_to_client(
                &state,
                client_id,
                "error",
                json!({ "sessionId": session_id, "message": err.to_string() }),
            )
            .await;
        }
    });
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        let Some(session_id) = data_str(&envelope.data, "sessionId").map(str::to_string) else {
            continue;
        };

        match envelope.event.as_str() {
            "session:join" => {
                let Some(session) = find_session(&state, &session_id).await else {
                    emit_unknown_session(&state, client_id, &session_id).await;
                    continue;
                };
                watch_session(&state, client_id, &session_id).await;
                let messages = session.lock().await.transcript().to_vec();
                emit_to_client(
                    &state,
                    client_id,
                    "session:history",
                    json!({ "sessionId": session_id, "messages": messages }),
                )
                .await;
            }
            "session:message" => {
                if let Some(text) = data_str(&envelope.data, "text") {
                    let input = SendInput::Text(text.to_string());
                    spawn_send(state.clone(), client_id, session_id, input);
                }
            }
            "session:button" => {
                if let Some(payload) = data_str(&envelope.data, "payload") {
                    let input = SendInput::Button {
                        payload: payload.to_string(),
                        title: data_str(&envelope.data, "title").map(str::to_string),
                    };
                    spawn_send(state.clone(), client_id, session_id, input);
                }
            }
            "session:clear" => match find_session(&state, &session_id).await {
                Some(session) => {
                    clear_session(&state, &session_id, &session).await;
                }
                None => emit_unknown_session(&state, client_id, &session_id).await,
            },
            other => warn!("ignoring unknown ws event {other}"),
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        unwatch(&mut rt, client_id);
    }

    send_task.abort();
}

pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;
    let port = config.port;
    info!("using botmon api at {}", config.api_url);

    let app = router(build_state(config)?);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("chatbot test console running at http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emptied_watcher_sets_are_dropped() {
        let state = build_state(Config::for_api("http://localhost:9").unwrap()).unwrap();
        watch_session(&state, 1, "a").await;
        watch_session(&state, 2, "a").await;
        watch_session(&state, 1, "b").await;
        {
            let rt = state.realtime.lock().await;
            assert_eq!(rt.session_watchers["a"].len(), 1);
            assert_eq!(rt.session_watchers["b"].len(), 1);
        }

        let mut rt = state.realtime.lock().await;
        unwatch(&mut rt, 1);
        unwatch(&mut rt, 2);
        unwatch(&mut rt, 3);
        assert!(rt.session_watchers.is_empty());
        assert!(rt.watched_session.is_empty());
    }
}
