use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use atoll_domain::DomainResult;
use atoll_domain::conversations::{Conversation, Message, MessagePage, Participant};
use atoll_domain::error::DomainError;
use atoll_domain::notifications::{
    DEFAULT_DISABLED_KINDS, Notification, NotificationChannel, NotificationKind, ReactionKind,
};
use atoll_domain::ports::BoxFuture;
use atoll_domain::ports::conversations::ConversationRepository;
use atoll_domain::ports::notifications::{
    CommentRef, ContentDirectory, DedupKey, DeliveryDispatcher, NotificationListQuery,
    NotificationRepository, PostRef, PreferenceStore, RetractFilter, UserRef,
};
use atoll_domain::util::format_ms_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{Value, to_value};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;
use tokio::sync::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    records: Arc<RwLock<HashMap<String, Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn active_by_key(&self, key: &DedupKey) -> Option<Notification> {
        self.records
            .read()
            .await
            .values()
            .find(|record| DedupKey::of(record).as_ref() == Some(key))
            .cloned()
    }
}

impl NotificationRepository for InMemoryNotificationRepository {
    fn insert(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification = notification.clone();
        Box::pin(async move {
            if let Some(key) = DedupKey::of(&notification) {
                if self.active_by_key(&key).await.is_some() {
                    return Err(DomainError::Conflict);
                }
            }
            let mut records = self.records.write().await;
            if records.contains_key(&notification.notification_id) {
                return Err(DomainError::Conflict);
            }
            records.insert(notification.notification_id.clone(), notification.clone());
            Ok(notification)
        })
    }

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let notification_id = notification_id.to_string();
        Box::pin(async move { Ok(self.records.read().await.get(&notification_id).cloned()) })
    }

    fn find_active_by_dedup(
        &self,
        key: &DedupKey,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.active_by_key(&key).await) })
    }

    fn delete(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let notification_id = notification_id.to_string();
        Box::pin(async move {
            self.records.write().await.remove(&notification_id);
            Ok(())
        })
    }

    fn delete_matching(&self, filter: &RetractFilter) -> BoxFuture<'_, DomainResult<usize>> {
        let filter = filter.clone();
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, record| !filter.matches(record));
            Ok(before - records.len())
        })
    }

    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let query = query.clone();
        Box::pin(async move {
            let mut records: Vec<Notification> = self
                .records
                .read()
                .await
                .values()
                .filter(|record| record.recipient_id == query.recipient_id)
                .filter(|record| !query.unread_only || !record.read)
                .filter(|record| !query.excluded_kinds.contains(&record.kind))
                .cloned()
                .collect();
            records.sort_by(|left, right| {
                right
                    .created_at_ms
                    .cmp(&left.created_at_ms)
                    .then_with(|| right.notification_id.cmp(&left.notification_id))
            });
            Ok(records
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .collect())
        })
    }

    fn count(
        &self,
        recipient_id: &str,
        read: bool,
        excluded_kinds: &[NotificationKind],
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let excluded_kinds = excluded_kinds.to_vec();
        Box::pin(async move {
            Ok(self
                .records
                .read()
                .await
                .values()
                .filter(|record| record.recipient_id == recipient_id)
                .filter(|record| record.read == read)
                .filter(|record| !excluded_kinds.contains(&record.kind))
                .count())
        })
    }

    fn set_read(
        &self,
        notification_id: &str,
        read: bool,
    ) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification_id = notification_id.to_string();
        Box::pin(async move {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&notification_id)
                .ok_or(DomainError::NotFound)?;
            record.read = read;
            Ok(record.clone())
        })
    }

    fn mark_all_read(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        Box::pin(async move {
            let mut records = self.records.write().await;
            let mut flipped = 0;
            for record in records.values_mut() {
                if record.recipient_id == recipient_id && !record.read {
                    record.read = true;
                    flipped += 1;
                }
            }
            Ok(flipped)
        })
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    participants: Arc<RwLock<HashMap<(String, String), Participant>>>,
    messages: Arc<RwLock<HashMap<(String, String), Message>>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> BoxFuture<'_, DomainResult<Conversation>> {
        let conversation = conversation.clone();
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            if conversations.contains_key(&conversation.conversation_id) {
                return Err(DomainError::Conflict);
            }
            conversations.insert(conversation.conversation_id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            Ok(self.conversations.read().await.get(&conversation_id).cloned())
        })
    }

    fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let user_a = user_a.to_string();
        let user_b = user_b.to_string();
        Box::pin(async move {
            let participants = self.participants.read().await;
            let conversations = self.conversations.read().await;
            let mut matches: Vec<Conversation> = conversations
                .values()
                .filter(|conversation| !conversation.is_channel)
                .filter(|conversation| {
                    let members: Vec<&str> = participants
                        .values()
                        .filter(|participant| {
                            participant.conversation_id == conversation.conversation_id
                        })
                        .map(|participant| participant.user_id.as_str())
                        .collect();
                    members.len() == 2
                        && members.contains(&user_a.as_str())
                        && members.contains(&user_b.as_str())
                })
                .cloned()
                .collect();
            matches.sort_by(|left, right| {
                right
                    .created_at_ms
                    .cmp(&left.created_at_ms)
                    .then_with(|| right.conversation_id.cmp(&left.conversation_id))
            });
            Ok(matches.into_iter().next())
        })
    }

    fn list_conversations_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Conversation>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let participants = self.participants.read().await;
            let conversations = self.conversations.read().await;
            Ok(participants
                .values()
                .filter(|participant| participant.user_id == user_id)
                .filter_map(|participant| conversations.get(&participant.conversation_id).cloned())
                .collect())
        })
    }

    fn list_channels(&self) -> BoxFuture<'_, DomainResult<Vec<Conversation>>> {
        Box::pin(async move {
            let mut channels: Vec<Conversation> = self
                .conversations
                .read()
                .await
                .values()
                .filter(|conversation| conversation.is_channel)
                .cloned()
                .collect();
            channels.sort_by(|left, right| right.created_at_ms.cmp(&left.created_at_ms));
            Ok(channels)
        })
    }

    fn channel_count(&self) -> BoxFuture<'_, DomainResult<usize>> {
        Box::pin(async move {
            Ok(self
                .conversations
                .read()
                .await
                .values()
                .filter(|conversation| conversation.is_channel)
                .count())
        })
    }

    fn create_participant(
        &self,
        participant: &Participant,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        let participant = participant.clone();
        Box::pin(async move {
            let key = (
                participant.conversation_id.clone(),
                participant.user_id.clone(),
            );
            let mut participants = self.participants.write().await;
            if participants.contains_key(&key) {
                return Err(DomainError::Conflict);
            }
            participants.insert(key, participant.clone());
            Ok(participant)
        })
    }

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>> {
        let key = (conversation_id.to_string(), user_id.to_string());
        Box::pin(async move { Ok(self.participants.read().await.get(&key).cloned()) })
    }

    fn delete_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let key = (conversation_id.to_string(), user_id.to_string());
        Box::pin(async move {
            self.participants.write().await.remove(&key);
            Ok(())
        })
    }

    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            Ok(self
                .participants
                .read()
                .await
                .values()
                .filter(|participant| participant.conversation_id == conversation_id)
                .cloned()
                .collect())
        })
    }

    fn advance_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        let key = (conversation_id.to_string(), user_id.to_string());
        Box::pin(async move {
            let mut participants = self.participants.write().await;
            let participant = participants.get_mut(&key).ok_or(DomainError::NotFound)?;
            let current = participant.last_read_at_ms.unwrap_or(i64::MIN);
            participant.last_read_at_ms = Some(current.max(read_at_ms));
            Ok(participant.clone())
        })
    }

    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<Message>> {
        let mut message = message.clone();
        Box::pin(async move {
            // The conversation write lock is the per-conversation serializer
            // here: clamp, insert, and pointer update happen under it.
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .get_mut(&message.conversation_id)
                .ok_or(DomainError::NotFound)?;
            if let Some(last_ms) = conversation.last_message_at_ms {
                message.created_at_ms = message.created_at_ms.max(last_ms);
            }
            let mut messages = self.messages.write().await;
            let message_key = (message.conversation_id.clone(), message.message_id.clone());
            if messages.contains_key(&message_key) {
                return Err(DomainError::Conflict);
            }
            messages.insert(message_key, message.clone());
            if conversation.last_message_at_ms.unwrap_or(i64::MIN) <= message.created_at_ms {
                conversation.last_message_id = Some(message.message_id.clone());
                conversation.last_message_at_ms = Some(message.created_at_ms);
            }
            Ok(message)
        })
    }

    fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let key = (conversation_id.to_string(), message_id.to_string());
        Box::pin(async move { Ok(self.messages.read().await.get(&key).cloned()) })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
        page: &MessagePage,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let conversation_id = conversation_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            let mut messages: Vec<Message> = self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect();
            messages.sort_by(|left, right| {
                left.created_at_ms
                    .cmp(&right.created_at_ms)
                    .then_with(|| left.message_id.cmp(&right.message_id))
            });
            Ok(messages
                .into_iter()
                .skip(page.page.saturating_mul(page.per_page))
                .take(page.per_page)
                .collect())
        })
    }

    fn count_messages_after(
        &self,
        conversation_id: &str,
        after_ms: Option<i64>,
        excluding_sender: &str,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let conversation_id = conversation_id.to_string();
        let excluding_sender = excluding_sender.to_string();
        Box::pin(async move {
            Ok(self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.conversation_id == conversation_id)
                .filter(|message| message.sender_id != excluding_sender)
                .filter(|message| after_ms.is_none_or(|after| message.created_at_ms > after))
                .count())
        })
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    disabled: Arc<RwLock<HashSet<(String, NotificationKind, NotificationChannel)>>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the default-disabled kinds for a freshly created user. Called
    /// once from the user-provisioning path, not on every lookup.
    pub async fn register_user(&self, user_id: &str) {
        let mut disabled = self.disabled.write().await;
        for kind in DEFAULT_DISABLED_KINDS {
            disabled.insert((user_id.to_string(), *kind, NotificationChannel::InApp));
        }
    }

    pub async fn set_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
        suppressed: bool,
    ) {
        let entry = (user_id.to_string(), kind, channel);
        let mut disabled = self.disabled.write().await;
        if suppressed {
            disabled.insert(entry);
        } else {
            disabled.remove(&entry);
        }
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn is_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let entry = (user_id.to_string(), kind, channel);
        Box::pin(async move { Ok(self.disabled.read().await.contains(&entry)) })
    }
}

/// Read-only fixture directory standing in for the platform's entity CRUD.
#[derive(Default)]
pub struct StaticContentDirectory {
    users: Arc<RwLock<HashMap<String, UserRef>>>,
    posts: Arc<RwLock<HashMap<String, PostRef>>>,
    comments: Arc<RwLock<HashMap<String, CommentRef>>>,
}

impl StaticContentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: &str, username: &str) {
        self.users.write().await.insert(
            user_id.to_string(),
            UserRef {
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
        );
    }

    pub async fn add_post(&self, post_id: &str, author_id: &str) {
        self.posts.write().await.insert(
            post_id.to_string(),
            PostRef {
                post_id: post_id.to_string(),
                author_id: author_id.to_string(),
            },
        );
    }

    pub async fn add_comment(&self, comment_id: &str, post_id: &str, author_id: &str) {
        self.comments.write().await.insert(
            comment_id.to_string(),
            CommentRef {
                comment_id: comment_id.to_string(),
                post_id: post_id.to_string(),
                author_id: author_id.to_string(),
            },
        );
    }
}

impl ContentDirectory for StaticContentDirectory {
    fn get_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserRef>>> {
        let user_id = user_id.to_string();
        Box::pin(async move { Ok(self.users.read().await.get(&user_id).cloned()) })
    }

    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<PostRef>>> {
        let post_id = post_id.to_string();
        Box::pin(async move { Ok(self.posts.read().await.get(&post_id).cloned()) })
    }

    fn get_comment(&self, comment_id: &str) -> BoxFuture<'_, DomainResult<Option<CommentRef>>> {
        let comment_id = comment_id.to_string();
        Box::pin(async move { Ok(self.comments.read().await.get(&comment_id).cloned()) })
    }
}

/// Stands in for the external delivery channel: logs the hand-off and
/// reports success. Swapped for a real sender in deployments that have one.
#[derive(Default, Clone)]
pub struct TracingDeliveryDispatcher;

impl TracingDeliveryDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl DeliveryDispatcher for TracingDeliveryDispatcher {
    fn deliver(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<()>> {
        let notification_id = notification.notification_id.clone();
        let recipient_id = notification.recipient_id.clone();
        let kind = notification.kind;
        Box::pin(async move {
            tracing::info!(
                notification_id,
                recipient_id,
                kind = ?kind,
                "notification handed to delivery channel"
            );
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// SurrealDB backend
// ---------------------------------------------------------------------------

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let error_message = err.to_string().to_lowercase();
    if error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
        || error_message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Storage(format!("surreal query failed: {error_message}"))
}

fn enum_token<T: Serialize>(value: &T) -> DomainResult<String> {
    match to_value(value) {
        Ok(Value::String(token)) => Ok(token),
        _ => Err(DomainError::Validation("invalid enum token".into())),
    }
}

fn decode_rows<T: for<'de> Deserialize<'de>>(rows: Vec<Value>, label: &str) -> DomainResult<Vec<T>> {
    rows.into_iter()
        .filter(|row| !row.is_null())
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|err| DomainError::Storage(format!("invalid {label} row: {err}")))
        })
        .collect()
}

fn decode_count(rows: Vec<Value>, label: &str) -> DomainResult<usize> {
    let Some(row) = rows.into_iter().next() else {
        return Ok(0);
    };
    let Some(value) = row.get("count") else {
        return Err(DomainError::Storage(format!("{label} count missing")));
    };
    let count = value
        .as_u64()
        .or_else(|| value.as_i64().and_then(|value| value.try_into().ok()))
        .ok_or_else(|| DomainError::Storage(format!("invalid {label} count")))?;
    Ok(count as usize)
}

fn take_rows(response: &mut surrealdb::Response, index: usize) -> DomainResult<Vec<Value>> {
    response
        .take(index)
        .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))
}

fn dedupe_string(notification: &Notification) -> DomainResult<String> {
    match DedupKey::of(notification) {
        Some(key) => dedup_key_string(&key),
        // Non-toggleable records never collide: their own id is the key.
        None => Ok(notification.notification_id.clone()),
    }
}

fn dedup_key_string(key: &DedupKey) -> DomainResult<String> {
    let reaction = match key.reaction_kind.as_ref() {
        Some(reaction_kind) => enum_token(reaction_kind)?,
        None => "-".to_string(),
    };
    Ok(format!(
        "{}:{}:{}:{}:{}",
        enum_token(&key.kind)?,
        key.actor_id,
        key.post_id.as_deref().unwrap_or("-"),
        key.comment_id.as_deref().unwrap_or("-"),
        reaction,
    ))
}

/// One-time table and index definitions. The unique index on the dedup key
/// is the backstop for concurrent toggles; the participant index enforces
/// the one-record-per-(conversation, user) invariant.
pub async fn define_schema(client: &Surreal<Client>) -> DomainResult<()> {
    client
        .query(
            "DEFINE TABLE IF NOT EXISTS notification SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS notification_key ON TABLE notification COLUMNS notification_id UNIQUE;
             DEFINE INDEX IF NOT EXISTS notification_dedupe ON TABLE notification COLUMNS dedupe_key UNIQUE;
             DEFINE INDEX IF NOT EXISTS notification_recipient ON TABLE notification COLUMNS recipient_id, created_at_ms;
             DEFINE TABLE IF NOT EXISTS conversation SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS conversation_key ON TABLE conversation COLUMNS conversation_id UNIQUE;
             DEFINE TABLE IF NOT EXISTS participant SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS participant_member ON TABLE participant COLUMNS conversation_id, user_id UNIQUE;
             DEFINE TABLE IF NOT EXISTS message SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS message_key ON TABLE message COLUMNS message_id UNIQUE;
             DEFINE INDEX IF NOT EXISTS message_conversation ON TABLE message COLUMNS conversation_id, created_at_ms;
             DEFINE TABLE IF NOT EXISTS user_preference SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS preference_key ON TABLE user_preference COLUMNS user_id, kind, channel UNIQUE;",
        )
        .await
        .map_err(map_surreal_error)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationRow {
    notification_id: String,
    kind: NotificationKind,
    recipient_id: String,
    actor_id: Option<String>,
    post_id: Option<String>,
    comment_id: Option<String>,
    reaction_kind: Option<ReactionKind>,
    content: Option<String>,
    approved: Option<bool>,
    read: bool,
    created_at: String,
    created_at_ms: i64,
    dedupe_key: String,
}

impl NotificationRow {
    fn from_domain(notification: &Notification) -> DomainResult<Self> {
        Ok(Self {
            notification_id: notification.notification_id.clone(),
            kind: notification.kind,
            recipient_id: notification.recipient_id.clone(),
            actor_id: notification.actor_id.clone(),
            post_id: notification.post_id.clone(),
            comment_id: notification.comment_id.clone(),
            reaction_kind: notification.reaction_kind,
            content: notification.content.clone(),
            approved: notification.approved,
            read: notification.read,
            created_at: format_ms_rfc3339(notification.created_at_ms),
            created_at_ms: notification.created_at_ms,
            dedupe_key: dedupe_string(notification)?,
        })
    }

    fn into_domain(self) -> Notification {
        Notification {
            notification_id: self.notification_id,
            kind: self.kind,
            recipient_id: self.recipient_id,
            actor_id: self.actor_id,
            post_id: self.post_id,
            comment_id: self.comment_id,
            reaction_kind: self.reaction_kind,
            content: self.content,
            approved: self.approved,
            read: self.read,
            created_at_ms: self.created_at_ms,
        }
    }
}

pub struct SurrealNotificationRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealNotificationRepository {
    pub fn new(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    fn map_rows(rows: Vec<Value>) -> DomainResult<Vec<Notification>> {
        Ok(decode_rows::<NotificationRow>(rows, "notification")?
            .into_iter()
            .map(NotificationRow::into_domain)
            .collect())
    }
}

impl NotificationRepository for SurrealNotificationRepository {
    fn insert(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let payload = NotificationRow::from_domain(notification);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = to_value(payload?)
                .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            let mut response = client
                .query("CREATE notification CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_rows(rows)?;
            rows.pop()
                .ok_or_else(|| DomainError::Storage("create returned no row".to_string()))
        })
    }

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM notification WHERE notification_id = $notification_id LIMIT 1")
                .bind(("notification_id", notification_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_rows(rows)?;
            Ok(rows.pop())
        })
    }

    fn find_active_by_dedup(
        &self,
        key: &DedupKey,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let dedupe_key = dedup_key_string(key);
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM notification WHERE dedupe_key = $dedupe_key LIMIT 1")
                .bind(("dedupe_key", dedupe_key?))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_rows(rows)?;
            Ok(rows.pop())
        })
    }

    fn delete(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            client
                .query("DELETE notification WHERE notification_id = $notification_id")
                .bind(("notification_id", notification_id))
                .await
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }

    fn delete_matching(&self, filter: &RetractFilter) -> BoxFuture<'_, DomainResult<usize>> {
        let filter = filter.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut filters = vec![
                "kind = $kind".to_string(),
                "actor_id = $actor_id".to_string(),
            ];
            if filter.post_id.is_some() {
                filters.push("post_id = $post_id".to_string());
            }
            if filter.comment_id.is_some() {
                filters.push("comment_id = $comment_id".to_string());
            }
            if filter.reaction_kind.is_some() {
                filters.push("reaction_kind = $reaction_kind".to_string());
            }
            let statement = format!(
                "DELETE notification WHERE {} RETURN BEFORE",
                filters.join(" AND ")
            );

            let mut db_query = client
                .query(statement)
                .bind(("kind", enum_token(&filter.kind)?))
                .bind(("actor_id", filter.actor_id.clone()));
            if let Some(post_id) = filter.post_id.clone() {
                db_query = db_query.bind(("post_id", post_id));
            }
            if let Some(comment_id) = filter.comment_id.clone() {
                db_query = db_query.bind(("comment_id", comment_id));
            }
            if let Some(reaction_kind) = filter.reaction_kind.as_ref() {
                db_query = db_query.bind(("reaction_kind", enum_token(reaction_kind)?));
            }

            let mut response = db_query.await.map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Ok(rows.into_iter().filter(|row| !row.is_null()).count())
        })
    }

    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let query = query.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut filters = vec!["recipient_id = $recipient_id".to_string()];
            if query.unread_only {
                filters.push("read = false".to_string());
            }
            if !query.excluded_kinds.is_empty() {
                filters.push("kind NOT IN $excluded_kinds".to_string());
            }
            let statement = format!(
                "SELECT * FROM notification WHERE {} \
                 ORDER BY created_at_ms DESC, notification_id DESC \
                 LIMIT $limit START $offset",
                filters.join(" AND ")
            );

            let excluded: DomainResult<Vec<String>> =
                query.excluded_kinds.iter().map(enum_token).collect();
            let mut db_query = client
                .query(statement)
                .bind(("recipient_id", query.recipient_id.clone()))
                .bind(("limit", query.limit as i64))
                .bind(("offset", query.offset as i64));
            if !query.excluded_kinds.is_empty() {
                db_query = db_query.bind(("excluded_kinds", excluded?));
            }

            let mut response = db_query.await.map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Self::map_rows(rows)
        })
    }

    fn count(
        &self,
        recipient_id: &str,
        read: bool,
        excluded_kinds: &[NotificationKind],
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let excluded_kinds = excluded_kinds.to_vec();
        let client = self.client.clone();
        Box::pin(async move {
            let mut filters = vec![
                "recipient_id = $recipient_id".to_string(),
                "read = $read".to_string(),
            ];
            if !excluded_kinds.is_empty() {
                filters.push("kind NOT IN $excluded_kinds".to_string());
            }
            let statement = format!(
                "SELECT count() FROM notification WHERE {} GROUP ALL",
                filters.join(" AND ")
            );

            let excluded: DomainResult<Vec<String>> =
                excluded_kinds.iter().map(enum_token).collect();
            let mut db_query = client
                .query(statement)
                .bind(("recipient_id", recipient_id))
                .bind(("read", read));
            if !excluded_kinds.is_empty() {
                db_query = db_query.bind(("excluded_kinds", excluded?));
            }

            let mut response = db_query.await.map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            decode_count(rows, "notification")
        })
    }

    fn set_read(
        &self,
        notification_id: &str,
        read: bool,
    ) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification_id = notification_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE notification SET read = $read \
                     WHERE notification_id = $notification_id RETURN AFTER",
                )
                .bind(("notification_id", notification_id))
                .bind(("read", read))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_rows(rows)?;
            rows.pop().ok_or(DomainError::NotFound)
        })
    }

    fn mark_all_read(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let recipient_id = recipient_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "UPDATE notification SET read = true \
                     WHERE recipient_id = $recipient_id AND read = false RETURN AFTER",
                )
                .bind(("recipient_id", recipient_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Ok(rows.into_iter().filter(|row| !row.is_null()).count())
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConversationRow {
    conversation_id: String,
    is_channel: bool,
    name: Option<String>,
    description: Option<String>,
    avatar: Option<String>,
    created_at: String,
    created_at_ms: i64,
    last_message_id: Option<String>,
    last_message_at_ms: Option<i64>,
}

impl ConversationRow {
    fn from_domain(conversation: &Conversation) -> Self {
        Self {
            conversation_id: conversation.conversation_id.clone(),
            is_channel: conversation.is_channel,
            name: conversation.name.clone(),
            description: conversation.description.clone(),
            avatar: conversation.avatar.clone(),
            created_at: format_ms_rfc3339(conversation.created_at_ms),
            created_at_ms: conversation.created_at_ms,
            last_message_id: conversation.last_message_id.clone(),
            last_message_at_ms: conversation.last_message_at_ms,
        }
    }

    fn into_domain(self) -> Conversation {
        Conversation {
            conversation_id: self.conversation_id,
            is_channel: self.is_channel,
            name: self.name,
            description: self.description,
            avatar: self.avatar,
            created_at_ms: self.created_at_ms,
            last_message_id: self.last_message_id,
            last_message_at_ms: self.last_message_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ParticipantRow {
    conversation_id: String,
    user_id: String,
    last_read_at_ms: Option<i64>,
}

impl ParticipantRow {
    fn from_domain(participant: &Participant) -> Self {
        Self {
            conversation_id: participant.conversation_id.clone(),
            user_id: participant.user_id.clone(),
            last_read_at_ms: participant.last_read_at_ms,
        }
    }

    fn into_domain(self) -> Participant {
        Participant {
            conversation_id: self.conversation_id,
            user_id: self.user_id,
            last_read_at_ms: self.last_read_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRow {
    message_id: String,
    conversation_id: String,
    sender_id: String,
    content: String,
    reply_to_id: Option<String>,
    created_at: String,
    created_at_ms: i64,
}

impl MessageRow {
    fn from_domain(message: &Message) -> Self {
        Self {
            message_id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            reply_to_id: message.reply_to_id.clone(),
            created_at: format_ms_rfc3339(message.created_at_ms),
            created_at_ms: message.created_at_ms,
        }
    }

    fn into_domain(self) -> Message {
        Message {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            reply_to_id: self.reply_to_id,
            created_at_ms: self.created_at_ms,
        }
    }
}

pub struct SurrealConversationRepository {
    client: Arc<Surreal<Client>>,
    // Per-conversation single-writer locks for append; a global lock would
    // serialize unrelated conversations.
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SurrealConversationRepository {
    pub fn new(client: Arc<Surreal<Client>>) -> Self {
        Self {
            client,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn append_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn map_conversations(rows: Vec<Value>) -> DomainResult<Vec<Conversation>> {
        Ok(decode_rows::<ConversationRow>(rows, "conversation")?
            .into_iter()
            .map(ConversationRow::into_domain)
            .collect())
    }

    fn map_participants(rows: Vec<Value>) -> DomainResult<Vec<Participant>> {
        Ok(decode_rows::<ParticipantRow>(rows, "participant")?
            .into_iter()
            .map(ParticipantRow::into_domain)
            .collect())
    }

    fn map_messages(rows: Vec<Value>) -> DomainResult<Vec<Message>> {
        Ok(decode_rows::<MessageRow>(rows, "message")?
            .into_iter()
            .map(MessageRow::into_domain)
            .collect())
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> DomainResult<Option<Conversation>> {
        let mut response = self
            .client
            .query("SELECT * FROM conversation WHERE conversation_id = $conversation_id LIMIT 1")
            .bind(("conversation_id", conversation_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let rows = take_rows(&mut response, 0)?;
        let mut rows = Self::map_conversations(rows)?;
        Ok(rows.pop())
    }

    async fn conversation_ids_for_user(&self, user_id: &str) -> DomainResult<Vec<String>> {
        let mut response = self
            .client
            .query("SELECT conversation_id FROM participant WHERE user_id = $user_id")
            .bind(("user_id", user_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let rows = take_rows(&mut response, 0)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.get("conversation_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }

    async fn participant_count(&self, conversation_id: &str) -> DomainResult<usize> {
        let mut response = self
            .client
            .query(
                "SELECT count() FROM participant \
                 WHERE conversation_id = $conversation_id GROUP ALL",
            )
            .bind(("conversation_id", conversation_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let rows = take_rows(&mut response, 0)?;
        decode_count(rows, "participant")
    }
}

impl ConversationRepository for SurrealConversationRepository {
    fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> BoxFuture<'_, DomainResult<Conversation>> {
        let payload = ConversationRow::from_domain(conversation);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = to_value(payload)
                .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            let mut response = client
                .query("CREATE conversation CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_conversations(rows)?;
            rows.pop()
                .ok_or_else(|| DomainError::Storage("create returned no row".to_string()))
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move { self.fetch_conversation(&conversation_id).await })
    }

    fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let user_a = user_a.to_string();
        let user_b = user_b.to_string();
        Box::pin(async move {
            let ids_a: HashSet<String> =
                self.conversation_ids_for_user(&user_a).await?.into_iter().collect();
            if ids_a.is_empty() {
                return Ok(None);
            }
            let shared: Vec<String> = self
                .conversation_ids_for_user(&user_b)
                .await?
                .into_iter()
                .filter(|conversation_id| ids_a.contains(conversation_id))
                .collect();
            if shared.is_empty() {
                return Ok(None);
            }

            let mut response = self
                .client
                .query(
                    "SELECT * FROM conversation \
                     WHERE is_channel = false AND conversation_id IN $ids \
                     ORDER BY created_at_ms DESC, conversation_id DESC",
                )
                .bind(("ids", shared))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let candidates = Self::map_conversations(rows)?;

            for candidate in candidates {
                if self.participant_count(&candidate.conversation_id).await? == 2 {
                    return Ok(Some(candidate));
                }
            }
            Ok(None)
        })
    }

    fn list_conversations_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Conversation>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let ids = self.conversation_ids_for_user(&user_id).await?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut response = self
                .client
                .query("SELECT * FROM conversation WHERE conversation_id IN $ids")
                .bind(("ids", ids))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Self::map_conversations(rows)
        })
    }

    fn list_channels(&self) -> BoxFuture<'_, DomainResult<Vec<Conversation>>> {
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT * FROM conversation WHERE is_channel = true \
                     ORDER BY created_at_ms DESC, conversation_id DESC",
                )
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Self::map_conversations(rows)
        })
    }

    fn channel_count(&self) -> BoxFuture<'_, DomainResult<usize>> {
        Box::pin(async move {
            let mut response = self
                .client
                .query("SELECT count() FROM conversation WHERE is_channel = true GROUP ALL")
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            decode_count(rows, "conversation")
        })
    }

    fn create_participant(
        &self,
        participant: &Participant,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        let payload = ParticipantRow::from_domain(participant);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = to_value(payload)
                .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            let mut response = client
                .query("CREATE participant CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_participants(rows)?;
            rows.pop()
                .ok_or_else(|| DomainError::Storage("create returned no row".to_string()))
        })
    }

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT * FROM participant \
                     WHERE conversation_id = $conversation_id AND user_id = $user_id LIMIT 1",
                )
                .bind(("conversation_id", conversation_id))
                .bind(("user_id", user_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_participants(rows)?;
            Ok(rows.pop())
        })
    }

    fn delete_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<()>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.client
                .query(
                    "DELETE participant \
                     WHERE conversation_id = $conversation_id AND user_id = $user_id",
                )
                .bind(("conversation_id", conversation_id))
                .bind(("user_id", user_id))
                .await
                .map_err(map_surreal_error)?;
            Ok(())
        })
    }

    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query("SELECT * FROM participant WHERE conversation_id = $conversation_id")
                .bind(("conversation_id", conversation_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Self::map_participants(rows)
        })
    }

    fn advance_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            // Conditional write keeps the watermark monotonic even when a
            // stale client replays an old timestamp.
            let mut response = self
                .client
                .query(
                    "UPDATE participant SET last_read_at_ms = $read_at_ms \
                     WHERE conversation_id = $conversation_id AND user_id = $user_id \
                       AND (last_read_at_ms = NONE OR last_read_at_ms < $read_at_ms) \
                     RETURN AFTER",
                )
                .bind(("conversation_id", conversation_id.clone()))
                .bind(("user_id", user_id.clone()))
                .bind(("read_at_ms", read_at_ms))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_participants(rows)?;
            if let Some(updated) = rows.pop() {
                return Ok(updated);
            }

            // The guard declined the write: the current record already
            // carries a newer watermark, or the participant is missing.
            self.get_participant(&conversation_id, &user_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<Message>> {
        let message = message.clone();
        Box::pin(async move {
            let lock = self.append_lock(&message.conversation_id).await;
            let _guard = lock.lock().await;

            let conversation = self
                .fetch_conversation(&message.conversation_id)
                .await?
                .ok_or(DomainError::NotFound)?;

            let mut message = message;
            if let Some(last_ms) = conversation.last_message_at_ms {
                message.created_at_ms = message.created_at_ms.max(last_ms);
            }

            let payload = to_value(MessageRow::from_domain(&message))
                .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            let mut response = self
                .client
                .query("CREATE message CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_messages(rows)?;
            let message = rows
                .pop()
                .ok_or_else(|| DomainError::Storage("create returned no row".to_string()))?;

            // Timestamp-compare update: the pointer only moves forward, so
            // it ends at the greatest committed timestamp regardless of
            // commit order.
            self.client
                .query(
                    "UPDATE conversation SET \
                       last_message_id = $message_id, \
                       last_message_at_ms = $created_at_ms \
                     WHERE conversation_id = $conversation_id \
                       AND (last_message_at_ms = NONE OR last_message_at_ms <= $created_at_ms)",
                )
                .bind(("conversation_id", message.conversation_id.clone()))
                .bind(("message_id", message.message_id.clone()))
                .bind(("created_at_ms", message.created_at_ms))
                .await
                .map_err(map_surreal_error)?;

            Ok(message)
        })
    }

    fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT * FROM message \
                     WHERE conversation_id = $conversation_id AND message_id = $message_id LIMIT 1",
                )
                .bind(("conversation_id", conversation_id))
                .bind(("message_id", message_id))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            let mut rows = Self::map_messages(rows)?;
            Ok(rows.pop())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
        page: &MessagePage,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let conversation_id = conversation_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT * FROM message WHERE conversation_id = $conversation_id \
                     ORDER BY created_at_ms ASC, message_id ASC \
                     LIMIT $limit START $offset",
                )
                .bind(("conversation_id", conversation_id))
                .bind(("limit", page.per_page as i64))
                .bind(("offset", page.page.saturating_mul(page.per_page) as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Self::map_messages(rows)
        })
    }

    fn count_messages_after(
        &self,
        conversation_id: &str,
        after_ms: Option<i64>,
        excluding_sender: &str,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let conversation_id = conversation_id.to_string();
        let excluding_sender = excluding_sender.to_string();
        Box::pin(async move {
            let mut filters = vec![
                "conversation_id = $conversation_id".to_string(),
                "sender_id != $excluding_sender".to_string(),
            ];
            if after_ms.is_some() {
                filters.push("created_at_ms > $after_ms".to_string());
            }
            let statement = format!(
                "SELECT count() FROM message WHERE {} GROUP ALL",
                filters.join(" AND ")
            );

            let mut db_query = self
                .client
                .query(statement)
                .bind(("conversation_id", conversation_id))
                .bind(("excluding_sender", excluding_sender));
            if let Some(after_ms) = after_ms {
                db_query = db_query.bind(("after_ms", after_ms));
            }

            let mut response = db_query.await.map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            decode_count(rows, "message")
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PreferenceRow {
    user_id: String,
    kind: NotificationKind,
    channel: NotificationChannel,
}

pub struct SurrealPreferenceStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealPreferenceStore {
    pub fn new(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    /// Seeds the default-disabled kinds for a freshly created user.
    pub async fn register_user(&self, user_id: &str) -> DomainResult<()> {
        for kind in DEFAULT_DISABLED_KINDS {
            let payload = to_value(PreferenceRow {
                user_id: user_id.to_string(),
                kind: *kind,
                channel: NotificationChannel::InApp,
            })
            .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            let result = self
                .client
                .query("CREATE user_preference CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error);
            match result {
                Ok(_) => {}
                // Re-registration hits the unique index; the row is there.
                Err(DomainError::Conflict) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn set_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
        suppressed: bool,
    ) -> DomainResult<()> {
        if suppressed {
            let payload = to_value(PreferenceRow {
                user_id: user_id.to_string(),
                kind,
                channel,
            })
            .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;
            match self
                .client
                .query("CREATE user_preference CONTENT $payload")
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)
            {
                Ok(_) | Err(DomainError::Conflict) => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            self.client
                .query(
                    "DELETE user_preference WHERE user_id = $user_id \
                     AND kind = $kind AND channel = $channel",
                )
                .bind(("user_id", user_id.to_string()))
                .bind(("kind", enum_token(&kind)?))
                .bind(("channel", enum_token(&channel)?))
                .await
                .map_err(map_surreal_error)?;
            Ok(())
        }
    }
}

impl PreferenceStore for SurrealPreferenceStore {
    fn is_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
    ) -> BoxFuture<'_, DomainResult<bool>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT count() FROM user_preference WHERE user_id = $user_id \
                     AND kind = $kind AND channel = $channel GROUP ALL",
                )
                .bind(("user_id", user_id))
                .bind(("kind", enum_token(&kind)?))
                .bind(("channel", enum_token(&channel)?))
                .await
                .map_err(map_surreal_error)?;
            let rows = take_rows(&mut response, 0)?;
            Ok(decode_count(rows, "user_preference")? > 0)
        })
    }
}
