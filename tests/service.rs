use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use botmon_chatbot::app::{build_state, router};
use botmon_chatbot::config::Config;
use botmon_chatbot::prompting::{CLEARED_TEXT, LOGIN_REQUIRED_TEXT};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn history_body() -> Value {
    json!({
        "success": true,
        "data": { "messages": { "web:alice": [
            {
                "direction": "incoming",
                "message_type": "text",
                "message": "Track my order",
                "metadata": { "payload": "track_order", "title": "Track my order" },
                "timestamp": "2024-05-01T10:00:00Z"
            },
            {
                "direction": "outgoing",
                "message_type": "text",
                "message": "Your order is on the way, {{ username }}",
                "timestamp": "2024-05-01T10:00:01Z"
            }
        ]}}
    })
}

async fn backend(reply: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chatbot/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chatbot/test-chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply))
        .mount(&server)
        .await;
    server
}

fn app(server: &MockServer, token: Option<&str>) -> Router {
    let mut config = Config::for_api(&server.uri()).unwrap();
    config.token = token.map(str::to_string);
    router(build_state(config).unwrap())
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_session(app: &Router, body: Option<Value>) -> (String, Value) {
    let (status, created) = call(app, "POST", "/api/session", body).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["sessionId"].as_str().unwrap().to_string();
    (id, created)
}

#[tokio::test]
async fn health_reports_ok() {
    let server = backend(json!({ "response": "Nothing processed" })).await;
    let (status, body) = call(&app(&server, Some("secret")), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn sentinel_reply_is_answered_from_history() {
    let server = backend(json!({ "response": "Nothing processed" })).await;
    let app = app(&server, Some("secret"));
    let (id, created) = create_session(&app, Some(json!({ "username": "alice" }))).await;

    let messages = created["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[0]["message"]
        .as_str()
        .unwrap()
        .starts_with("Welcome to the chatbot test console, alice!"));

    let (status, outcome) = call(
        &app,
        "POST",
        &format!("/api/session/{id}/message"),
        Some(json!({ "text": "track_order" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["source"], "local");
    assert_eq!(outcome["userTurn"]["isUser"], true);
    assert_eq!(outcome["userTurn"]["message"], "track_order");
    assert_eq!(outcome["botTurn"]["isUser"], false);
    assert_eq!(outcome["botTurn"]["message"], "Your order is on the way, alice");
    assert_eq!(outcome["botTurn"]["message_type"], "text");

    let (_, transcript) = call(&app, "GET", &format!("/api/session/{id}/messages"), None).await;
    assert_eq!(transcript["messages"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn button_click_relays_the_payload() {
    let server = backend(json!({ "response": {
        "message": "Here is your tracking link",
        "message_type": "button",
        "metadata": { "buttons": [{ "payload": "home", "title": "Home" }] }
    }}))
    .await;
    let app = app(&server, Some("secret"));
    let (id, _) = create_session(&app, None).await;

    let (status, outcome) = call(
        &app,
        "POST",
        &format!("/api/session/{id}/button"),
        Some(json!({ "payload": "track_order", "title": "Track my order" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["source"], "remote");
    assert_eq!(outcome["userTurn"]["message"], "Track my order");
    assert_eq!(outcome["botTurn"]["message"], "Here is your tracking link");
    assert_eq!(outcome["botTurn"]["message_type"], "button");

    let requests = server.received_requests().await.unwrap();
    let relayed = requests
        .iter()
        .find(|request| request.url.path() == "/api/chatbot/test-chat")
        .unwrap();
    let sent: Value = serde_json::from_slice(&relayed.body).unwrap();
    assert_eq!(sent["message"], "track_order");
    assert_eq!(sent["metadata"]["payload"], "track_order");
    assert_eq!(sent["metadata"]["platform"], "web");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let server = backend(json!({ "response": "Nothing processed" })).await;
    let app = app(&server, Some("secret"));
    let (id, _) = create_session(&app, None).await;

    let (status, body) = call(
        &app,
        "POST",
        &format!("/api/session/{id}/message"),
        Some(json!({ "text": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "text is required");

    let (status, _) = call(&app, "GET", "/api/session/missing/messages", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "POST",
        "/api/session/missing/message",
        Some(json!({ "text": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flows_and_clear() {
    let server = backend(json!({ "response": "Nothing processed" })).await;
    let app = app(&server, Some("secret"));
    let (id, _) = create_session(&app, None).await;

    let (status, flows) = call(&app, "GET", &format!("/api/session/{id}/flows"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(flows["realFlowCount"], 2);
    assert_eq!(
        flows["flows"]["track_order"]["message"],
        "Your order is on the way, {{ username }}"
    );
    assert_eq!(flows["flows"]["track my order"], flows["flows"]["track_order"]);
    assert!(flows["menu"].is_null());

    let (status, cleared) = call(&app, "POST", &format!("/api/session/{id}/clear"), None).await;
    assert_eq!(status, StatusCode::OK);
    let messages = cleared["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["message"], CLEARED_TEXT);

    let (_, flows) = call(&app, "GET", &format!("/api/session/{id}/flows"), None).await;
    assert_eq!(flows["realFlowCount"], 2);
}

#[tokio::test]
async fn missing_token_never_calls_the_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "hi" })))
        .expect(0)
        .mount(&server)
        .await;

    let app = app(&server, None);
    let (id, created) = create_session(&app, Some(json!({}))).await;
    assert_eq!(created["messages"][0]["message"], LOGIN_REQUIRED_TEXT);

    let (status, outcome) = call(
        &app,
        "POST",
        &format!("/api/session/{id}/message"),
        Some(json!({ "text": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["source"], "local");
    assert!(outcome["botTurn"]["message"]
        .as_str()
        .unwrap()
        .starts_with("I don't have a specific response for \"hello\"."));
}

#[tokio::test]
async fn session_token_overrides_missing_config_token() {
    let server = backend(json!({ "response": "Hello from the bot" })).await;
    let app = app(&server, None);
    let (id, _) = create_session(&app, Some(json!({ "token": "per-session" }))).await;

    let (_, outcome) = call(
        &app,
        "POST",
        &format!("/api/session/{id}/message"),
        Some(json!({ "text": "hi" })),
    )
    .await;
    assert_eq!(outcome["source"], "remote");
    assert_eq!(outcome["botTurn"]["message"], "Hello from the bot");

    let (_, sessions) = call(&app, "GET", "/api/sessions", None).await;
    let sessions = sessions["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], id.as_str());
    assert_eq!(sessions[0]["flowCount"], 2);
}

#[tokio::test]
async fn overlapping_sends_get_one_reply_and_one_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chatbot/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chatbot/test-chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "response": "Slow answer" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = app(&server, Some("secret"));
    let (id, _) = create_session(&app, None).await;
    let uri = format!("/api/session/{id}/message");

    let (first, second) = tokio::join!(
        call(&app, "POST", &uri, Some(json!({ "text": "first" }))),
        call(&app, "POST", &uri, Some(json!({ "text": "second" }))),
    );
    let (accepted, rejected) = if first.0 == StatusCode::CREATED {
        ("first", second)
    } else {
        ("second", first)
    };
    assert_eq!(rejected.0, StatusCode::CONFLICT);
    assert_eq!(rejected.1["error"], "a message is already being sent");

    let (_, transcript) = call(&app, "GET", &format!("/api/session/{id}/messages"), None).await;
    let texts = transcript["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|turn| turn["message"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(texts.len(), 4);
    assert_eq!(texts[2], accepted);
    assert_eq!(texts[3], "Slow answer");
}

#[tokio::test]
async fn deleted_sessions_are_gone() {
    let server = backend(json!({ "response": "Nothing processed" })).await;
    let app = app(&server, Some("secret"));
    let (id, _) = create_session(&app, None).await;

    let (status, _) = call(&app, "DELETE", &format!("/api/session/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, "GET", &format!("/api/session/{id}/messages"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "DELETE", &format!("/api/session/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, sessions) = call(&app, "GET", "/api/sessions", None).await;
    assert!(sessions["sessions"].as_array().unwrap().is_empty());
}
