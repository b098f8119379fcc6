use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::notifications::{Notification, NotificationChannel, NotificationKind, ReactionKind};
use crate::ports::BoxFuture;

/// Exact-match identity of a toggleable notification: at most one active
/// record may exist per key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupKey {
    pub kind: NotificationKind,
    pub actor_id: String,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub reaction_kind: Option<ReactionKind>,
}

impl DedupKey {
    /// The dedup key of an existing record, when its kind participates in
    /// toggling at all (requires an actor).
    pub fn of(notification: &Notification) -> Option<Self> {
        if !notification.kind.is_toggleable() {
            return None;
        }
        let actor_id = notification.actor_id.clone()?;
        Some(Self {
            kind: notification.kind,
            actor_id,
            post_id: notification.post_id.clone(),
            comment_id: notification.comment_id.clone(),
            reaction_kind: notification.reaction_kind,
        })
    }
}

/// Targeted retraction filter. `None` subject fields match any value, so a
/// bare (kind, actor) filter sweeps every record the actor triggered.
#[derive(Clone, Debug)]
pub struct RetractFilter {
    pub kind: NotificationKind,
    pub actor_id: String,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub reaction_kind: Option<ReactionKind>,
}

impl RetractFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        notification.kind == self.kind
            && notification.actor_id.as_deref() == Some(self.actor_id.as_str())
            && self
                .post_id
                .as_ref()
                .is_none_or(|post_id| notification.post_id.as_ref() == Some(post_id))
            && self
                .comment_id
                .as_ref()
                .is_none_or(|comment_id| notification.comment_id.as_ref() == Some(comment_id))
            && self
                .reaction_kind
                .is_none_or(|reaction_kind| notification.reaction_kind == Some(reaction_kind))
    }
}

#[derive(Clone, Debug)]
pub struct NotificationListQuery {
    pub recipient_id: String,
    pub unread_only: bool,
    pub excluded_kinds: Vec<NotificationKind>,
    pub offset: usize,
    pub limit: usize,
}

pub trait NotificationRepository: Send + Sync {
    /// Inserts a new record. The dedup key of toggleable kinds carries a
    /// unique constraint; a violation surfaces as `DomainError::Conflict`.
    fn insert(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>>;

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>>;

    fn find_active_by_dedup(
        &self,
        key: &DedupKey,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>>;

    /// Hard delete. Deleting an id that no longer resolves is not an error.
    fn delete(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<()>>;

    /// Deletes every record the filter matches and returns how many went.
    fn delete_matching(&self, filter: &RetractFilter) -> BoxFuture<'_, DomainResult<usize>>;

    /// Excluded kinds are filtered out before the pagination window is
    /// applied; results are strictly `created_at` descending.
    fn list(
        &self,
        query: &NotificationListQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;

    fn count(
        &self,
        recipient_id: &str,
        read: bool,
        excluded_kinds: &[NotificationKind],
    ) -> BoxFuture<'_, DomainResult<usize>>;

    fn set_read(
        &self,
        notification_id: &str,
        read: bool,
    ) -> BoxFuture<'_, DomainResult<Notification>>;

    fn mark_all_read(&self, recipient_id: &str) -> BoxFuture<'_, DomainResult<usize>>;
}

/// Per-user suppression lookup, in-app and email configured independently.
/// Consulted, never mutated, by the ledger.
pub trait PreferenceStore: Send + Sync {
    fn is_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
    ) -> BoxFuture<'_, DomainResult<bool>>;
}

/// External delivery hand-off, invoked after the ledger write commits.
/// Failures are logged by the caller and never propagated.
pub trait DeliveryDispatcher: Send + Sync {
    fn deliver(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<()>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: String,
    pub username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostRef {
    pub post_id: String,
    pub author_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommentRef {
    pub comment_id: String,
    pub post_id: String,
    pub author_id: String,
}

/// Read-only entity lookups owned by the surrounding platform.
pub trait ContentDirectory: Send + Sync {
    fn get_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserRef>>>;

    fn get_post(&self, post_id: &str) -> BoxFuture<'_, DomainResult<Option<PostRef>>>;

    fn get_comment(&self, comment_id: &str) -> BoxFuture<'_, DomainResult<Option<CommentRef>>>;
}
