use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use atoll_domain::conversations::{
    ChannelCreate, Conversation, Message, Participant, SendMessageInput, build_message_page,
};
use atoll_domain::error::DomainError;
use atoll_domain::events::DomainEvent;
use atoll_domain::identity::ActorIdentity;
use atoll_domain::notifications::{ListNotificationsQuery, Notification, NotificationKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use validator::Validate;

use crate::middleware::AuthContext;
use crate::{error::ApiError, middleware as app_middleware, observability, state::AppState, validation};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/notifications", get(list_notifications))
        .route("/v1/notifications/count", get(count_notifications))
        .route("/v1/notifications/read-all", post(mark_all_notifications_read))
        .route(
            "/v1/notifications/{notification_id}/read",
            post(mark_notification_read),
        )
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/direct", post(get_or_create_direct))
        .route(
            "/v1/conversations/channels",
            post(create_channel).get(list_channels),
        )
        .route("/v1/conversations/{conversation_id}/join", post(join_channel))
        .route("/v1/conversations/{conversation_id}/leave", post(leave_channel))
        .route(
            "/v1/conversations/{conversation_id}/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/v1/conversations/{conversation_id}/read",
            post(mark_conversation_read),
        )
        .route(
            "/v1/conversations/{conversation_id}/unread-count",
            get(unread_count),
        )
        .route(
            "/v1/conversations/{conversation_id}/participants",
            get(list_participants),
        )
        .route("/internal/v1/events", post(ingest_event))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::track_metrics_middleware))
        .layer(app_middleware::timeout_layer(&state.config))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        if let Some(config) = GovernorConfigBuilder::default()
            .per_second(100)
            .burst_size(200)
            .finish()
        {
            app = app.layer(GovernorLayer {
                config: Arc::new(config),
            });
        }
    }

    app.with_state(state)
}

fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::NotFound => ApiError::NotFound,
        DomainError::Forbidden(_) => ApiError::Forbidden,
        DomainError::InvalidReference(message) => ApiError::InvalidReference(message),
        DomainError::Conflict => ApiError::Conflict,
        DomainError::Storage(message) => {
            tracing::error!(error = %message, "storage failure");
            ApiError::Internal
        }
    }
}

fn actor_identity(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    let user_id = auth.user_id.clone().ok_or(ApiError::Unauthorized)?;
    let username = auth.username.clone().unwrap_or_else(|| user_id.clone());
    Ok(ActorIdentity { user_id, username })
}

fn parse_excluded_kinds(raw: Option<&str>) -> Result<Vec<NotificationKind>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            serde_json::from_value::<NotificationKind>(Value::String(token.to_string()))
                .map_err(|_| ApiError::Validation(format!("unknown notification kind '{token}'")))
        })
        .collect()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => ApiError::Internal.into_response(),
    }
}

// -- Notifications --

#[derive(Debug, Deserialize)]
struct NotificationListParams {
    unread_only: Option<bool>,
    exclude: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<NotificationListParams>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let excluded_kinds = parse_excluded_kinds(params.exclude.as_deref())?;

    let service = state.notifications();
    let items = service
        .list(ListNotificationsQuery {
            recipient_id: actor.user_id,
            unread_only: params.unread_only.unwrap_or(false),
            excluded_kinds,
            page: params.page.unwrap_or(0),
            per_page: params.per_page,
        })
        .await
        .map_err(map_domain_error)?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
struct NotificationCountParams {
    read: Option<bool>,
    exclude: Option<String>,
}

async fn count_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<NotificationCountParams>,
) -> Result<Json<Value>, ApiError> {
    let actor = actor_identity(&auth)?;
    let excluded_kinds = parse_excluded_kinds(params.exclude.as_deref())?;

    let service = state.notifications();
    let count = service
        .count(&actor.user_id, params.read.unwrap_or(false), &excluded_kinds)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(json!({ "count": count })))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(notification_id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.notifications();
    let notification = service
        .mark_read(&actor.user_id, &notification_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(notification))
}

async fn mark_all_notifications_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.notifications();
    let updated = service
        .mark_all_read(&actor.user_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(json!({ "updated": updated })))
}

async fn ingest_event(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(event): Json<DomainEvent>,
) -> Result<Json<Value>, ApiError> {
    actor_identity(&auth)?;
    state
        .event_fanout()
        .handle(event)
        .await
        .map_err(map_domain_error)?;
    observability::register_notification_outcome("event_accepted");
    Ok(Json(json!({ "status": "accepted" })))
}

// -- Conversations --

async fn list_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let conversations = service
        .list_conversations(&actor)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize, Validate)]
struct DirectConversationRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

async fn get_or_create_direct(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<DirectConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let conversation = service
        .get_or_create_direct(&actor.user_id, &payload.user_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateChannelRequest {
    #[validate(length(min = 1, max = 100))]
    name: String,
    description: Option<String>,
    avatar: Option<String>,
}

async fn create_channel(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateChannelRequest>,
) -> Result<Json<Conversation>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let channel = service
        .create_channel(
            &actor,
            ChannelCreate {
                name: payload.name,
                description: payload.description,
                avatar: payload.avatar,
            },
        )
        .await
        .map_err(map_domain_error)?;
    Ok(Json(channel))
}

async fn list_channels(
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let service = state.conversations();
    let channels = service.list_channels().await.map_err(map_domain_error)?;
    Ok(Json(channels))
}

async fn join_channel(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Participant>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let participant = service
        .join_channel(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(participant))
}

async fn leave_channel(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    service
        .leave_channel(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(json!({ "status": "left" })))
}

#[derive(Debug, Deserialize)]
struct MessageListParams {
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
    Query(params): Query<MessageListParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let messages = service
        .list_messages(
            &actor,
            &conversation_id,
            build_message_page(params.page, params.per_page),
        )
        .await
        .map_err(map_domain_error)?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize, Validate)]
struct SendMessageRequest {
    #[validate(length(min = 1, max = 2000))]
    content: String,
    reply_to_id: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let message = service
        .send_message(
            &actor,
            SendMessageInput {
                conversation_id,
                content: payload.content,
                reply_to_id: payload.reply_to_id,
            },
        )
        .await
        .map_err(map_domain_error)?;
    observability::register_message_sent();
    Ok(Json(message))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Participant>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let participant = service
        .mark_read(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(participant))
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let count = service
        .unread_count(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(json!({ "count": count })))
}

async fn list_participants(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Participant>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let service = state.conversations();
    let participants = service
        .list_participants(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(participants))
}
