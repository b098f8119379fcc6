use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use tower::ServiceExt;

use atoll_infra::config::AppConfig;

use crate::routes;
use crate::state::AppState;

#[derive(Serialize)]
struct Claims {
    sub: String,
    username: String,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
        surreal_ns: "atoll".to_string(),
        surreal_db: "platform".to_string(),
        surreal_user: "root".to_string(),
        surreal_pass: "root".to_string(),
        jwt_secret: "test-secret".to_string(),
        auth_dev_bypass_enabled: false,
        request_timeout_secs: 5,
    }
}

fn test_token(user_id: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: user_id.to_string(),
        username: user_id.to_string(),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret("test-secret".as_bytes()),
    )
    .expect("token")
}

async fn test_app() -> (Router, AppState) {
    let state = AppState::new(test_config()).await.expect("state");
    (routes::router(state.clone()), state)
}

async fn send_request(
    app: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_public() {
    let (app, _) = test_app().await;
    let (status, body) = send_request(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn protected_routes_reject_missing_and_bad_tokens() {
    let (app, _) = test_app().await;

    let (status, _) = send_request(&app, "GET", "/v1/notifications", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) =
        send_request(&app, "GET", "/v1/notifications", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reaction_event_toggles_a_notification() {
    let (app, state) = test_app().await;
    state.directory.add_user("author-1", "ayu").await;
    state.directory.add_post("post-1", "author-1").await;
    let fan = test_token("fan-1");
    let author = test_token("author-1");

    let event = json!({
        "event": "post_reacted",
        "actor_id": "fan-1",
        "post_id": "post-1",
        "reaction": "like",
    });

    let (status, _) =
        send_request(&app, "POST", "/internal/v1/events", Some(&fan), Some(event.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        send_request(&app, "GET", "/v1/notifications", Some(&author), None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().expect("array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["kind"], "reaction");
    assert_eq!(items[0]["actor_id"], "fan-1");
    assert_eq!(items[0]["reaction_kind"], "like");

    let (status, body) =
        send_request(&app, "GET", "/v1/notifications/count", Some(&author), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    // Same action again: the toggle retracts instead of duplicating.
    let (status, _) =
        send_request(&app, "POST", "/internal/v1/events", Some(&fan), Some(event)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        send_request(&app, "GET", "/v1/notifications", Some(&author), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().expect("array").len(), 0);
}

#[tokio::test]
async fn excluded_kinds_are_filtered_from_list_and_count() {
    let (app, state) = test_app().await;
    state.directory.add_user("author-1", "ayu").await;
    state.directory.add_post("post-1", "author-1").await;
    state.directory.add_comment("comment-1", "post-1", "author-1").await;
    let fan = test_token("fan-1");
    let author = test_token("author-1");

    let like = json!({
        "event": "post_reacted",
        "actor_id": "fan-1",
        "post_id": "post-1",
        "reaction": "like",
    });
    let reply = json!({
        "event": "comment_replied",
        "actor_id": "fan-1",
        "comment_id": "comment-1",
        "preview": "nice",
    });
    send_request(&app, "POST", "/internal/v1/events", Some(&fan), Some(like)).await;
    send_request(&app, "POST", "/internal/v1/events", Some(&fan), Some(reply)).await;

    let (status, body) = send_request(
        &app,
        "GET",
        "/v1/notifications?exclude=reaction",
        Some(&author),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().expect("array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["kind"], "comment_reply");

    let (_, body) = send_request(
        &app,
        "GET",
        "/v1/notifications/count?exclude=reaction",
        Some(&author),
        None,
    )
    .await;
    assert_eq!(body["count"], 1);

    let (status, _) = send_request(
        &app,
        "GET",
        "/v1/notifications?exclude=bogus",
        Some(&author),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mark_read_enforces_ownership_over_http() {
    let (app, state) = test_app().await;
    state.directory.add_user("author-1", "ayu").await;
    state.directory.add_post("post-1", "author-1").await;
    let fan = test_token("fan-1");
    let author = test_token("author-1");
    let intruder = test_token("intruder");

    let event = json!({
        "event": "post_reacted",
        "actor_id": "fan-1",
        "post_id": "post-1",
        "reaction": "fire",
    });
    send_request(&app, "POST", "/internal/v1/events", Some(&fan), Some(event)).await;

    let (_, body) = send_request(&app, "GET", "/v1/notifications", Some(&author), None).await;
    let notification_id = body[0]["notification_id"].as_str().expect("id").to_string();

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/notifications/{notification_id}/read"),
        Some(&intruder),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_request(
        &app,
        "POST",
        "/v1/notifications/missing-id/read",
        Some(&author),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_request(
        &app,
        "POST",
        &format!("/v1/notifications/{notification_id}/read"),
        Some(&author),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["read"], true);
}

#[tokio::test]
async fn direct_message_flow_tracks_unread_counts() {
    let (app, _) = test_app().await;
    let alice = test_token("alice");
    let bob = test_token("bob");

    let (status, body) = send_request(
        &app,
        "POST",
        "/v1/conversations/direct",
        Some(&alice),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conversation_id = body["conversation_id"].as_str().expect("id").to_string();
    assert_eq!(body["is_channel"], false);

    let (status, message) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/messages"),
        Some(&alice),
        Some(json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["sender_id"], "alice");

    let unread_path = format!("/v1/conversations/{conversation_id}/unread-count");
    let (_, body) = send_request(&app, "GET", &unread_path, Some(&bob), None).await;
    assert_eq!(body["count"], 1);
    let (_, body) = send_request(&app, "GET", &unread_path, Some(&alice), None).await;
    assert_eq!(body["count"], 0);

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/read"),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send_request(&app, "GET", &unread_path, Some(&bob), None).await;
    assert_eq!(body["count"], 0);

    send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/messages"),
        Some(&alice),
        Some(json!({ "content": "again" })),
    )
    .await;
    let (_, body) = send_request(&app, "GET", &unread_path, Some(&bob), None).await;
    assert_eq!(body["count"], 1);

    // Reusing the pair returns the same conversation.
    let (_, body) = send_request(
        &app,
        "POST",
        "/v1/conversations/direct",
        Some(&bob),
        Some(json!({ "user_id": "alice" })),
    )
    .await;
    assert_eq!(body["conversation_id"], conversation_id.as_str());
}

#[tokio::test]
async fn non_participants_are_forbidden() {
    let (app, _) = test_app().await;
    let alice = test_token("alice");
    let mallory = test_token("mallory");

    let (_, body) = send_request(
        &app,
        "POST",
        "/v1/conversations/direct",
        Some(&alice),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    let conversation_id = body["conversation_id"].as_str().expect("id").to_string();

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/messages"),
        Some(&mallory),
        Some(json!({ "content": "let me in" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{conversation_id}/read"),
        Some(&mallory),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_request(
        &app,
        "GET",
        "/v1/conversations/missing/unread-count",
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_conversation_reply_is_unprocessable() {
    let (app, _) = test_app().await;
    let alice = test_token("alice");

    let (_, first) = send_request(
        &app,
        "POST",
        "/v1/conversations/direct",
        Some(&alice),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    let first_id = first["conversation_id"].as_str().expect("id").to_string();

    let (_, second) = send_request(
        &app,
        "POST",
        "/v1/conversations/direct",
        Some(&alice),
        Some(json!({ "user_id": "carol" })),
    )
    .await;
    let second_id = second["conversation_id"].as_str().expect("id").to_string();

    let (_, foreign) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{second_id}/messages"),
        Some(&alice),
        Some(json!({ "content": "elsewhere" })),
    )
    .await;
    let foreign_id = foreign["message_id"].as_str().expect("id").to_string();

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{first_id}/messages"),
        Some(&alice),
        Some(json!({ "content": "reply", "reply_to_id": foreign_id })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn channels_list_and_replay_messages() {
    let (app, _) = test_app().await;
    let alice = test_token("alice");
    let bob = test_token("bob");

    let (status, channel) = send_request(
        &app,
        "POST",
        "/v1/conversations/channels",
        Some(&alice),
        Some(json!({ "name": "general", "description": "open floor" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(channel["is_channel"], true);
    let channel_id = channel["conversation_id"].as_str().expect("id").to_string();

    let (status, _) = send_request(
        &app,
        "POST",
        &format!("/v1/conversations/{channel_id}/join"),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for content in ["first", "second"] {
        send_request(
            &app,
            "POST",
            &format!("/v1/conversations/{channel_id}/messages"),
            Some(&alice),
            Some(json!({ "content": content })),
        )
        .await;
    }

    let (status, body) = send_request(
        &app,
        "GET",
        &format!("/v1/conversations/{channel_id}/messages"),
        Some(&bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let contents: Vec<&str> = body
        .as_array()
        .expect("array")
        .iter()
        .map(|message| message["content"].as_str().expect("content"))
        .collect();
    assert_eq!(contents, vec!["first", "second"]);

    let (_, channels) =
        send_request(&app, "GET", "/v1/conversations/channels", Some(&bob), None).await;
    assert_eq!(channels.as_array().expect("array").len(), 1);

    let (_, conversations) =
        send_request(&app, "GET", "/v1/conversations", Some(&bob), None).await;
    assert_eq!(conversations.as_array().expect("array").len(), 1);
}
