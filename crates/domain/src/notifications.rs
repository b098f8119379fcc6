use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::notifications::{
    ContentDirectory, DedupKey, DeliveryDispatcher, NotificationListQuery, NotificationRepository,
    PreferenceStore, RetractFilter,
};
use crate::util::now_ms;

const MAX_CONTENT_LENGTH: usize = 1_000;
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Kinds disabled in-app for newly created users. Applied once at
/// user-creation time by whoever provisions preference rows, never re-read
/// implicitly afterwards.
pub const DEFAULT_DISABLED_KINDS: &[NotificationKind] =
    &[NotificationKind::PostViewed, NotificationKind::UserActivity];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PostViewed,
    CommentReply,
    Reaction,
    PostReviewRequest,
    PostReviewed,
    PostDeleted,
    PostUpdated,
    PostSubscribed,
    PostUnsubscribed,
    FollowedPost,
    UserFollowed,
    UserUnfollowed,
    UserActivity,
    RegisterRequest,
    ActivityRedeem,
    PointRedeem,
    LotteryWin,
    LotteryDraw,
    PollVote,
    PollResultOwner,
    PollResultParticipant,
    PostFeatured,
    Mention,
}

impl NotificationKind {
    /// A toggleable kind represents a binary on/off state: a repeat trigger
    /// with the same dedup key retracts the prior record instead of
    /// accumulating a duplicate.
    pub fn is_toggleable(self) -> bool {
        matches!(
            self,
            NotificationKind::Reaction
                | NotificationKind::UserFollowed
                | NotificationKind::PostSubscribed
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Dislike,
    Smile,
    Recommend,
    Congratulations,
    Angry,
    Flushed,
    StarStruck,
    Rofl,
    HoldingBackTears,
    MindBlown,
    Poop,
    Clown,
    Skull,
    Fire,
    Eyes,
    Frown,
    Hot,
    Eagle,
    Spider,
    Bat,
    China,
    Usa,
    Japan,
    Korea,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    InApp,
    Email,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub notification_id: String,
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub reaction_kind: Option<ReactionKind>,
    pub content: Option<String>,
    pub approved: Option<bool>,
    pub read: bool,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct NotificationCreate {
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub reaction_kind: Option<ReactionKind>,
    pub content: Option<String>,
    pub approved: Option<bool>,
}

#[derive(Clone, Debug)]
pub enum ToggleOutcome {
    Created(Notification),
    Retracted,
    Suppressed,
}

#[derive(Clone, Debug)]
pub struct ListNotificationsQuery {
    pub recipient_id: String,
    pub unread_only: bool,
    pub excluded_kinds: Vec<NotificationKind>,
    pub page: usize,
    pub per_page: Option<usize>,
}

#[derive(Clone)]
pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    preferences: Arc<dyn PreferenceStore>,
    directory: Arc<dyn ContentDirectory>,
    dispatcher: Arc<dyn DeliveryDispatcher>,
}

impl NotificationService {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        preferences: Arc<dyn PreferenceStore>,
        directory: Arc<dyn ContentDirectory>,
        dispatcher: Arc<dyn DeliveryDispatcher>,
    ) -> Self {
        Self {
            repository,
            preferences,
            directory,
            dispatcher,
        }
    }

    /// Records the notification a domain action produced, or retracts the
    /// prior one when a toggleable action fires a second time.
    pub async fn create_or_toggle(&self, input: NotificationCreate) -> DomainResult<ToggleOutcome> {
        validate_notification_input(&input)?;
        self.directory
            .get_user(&input.recipient_id)
            .await?
            .ok_or(DomainError::NotFound)?;

        if self
            .is_suppressed(&input.recipient_id, input.kind, NotificationChannel::InApp)
            .await
        {
            return Ok(ToggleOutcome::Suppressed);
        }

        if !input.kind.is_toggleable() {
            let notification = self.repository.insert(&build_notification(&input)).await?;
            self.dispatch_delivery(notification.clone());
            return Ok(ToggleOutcome::Created(notification));
        }

        let key = toggle_key(&input)?;
        if let Some(existing) = self.repository.find_active_by_dedup(&key).await? {
            self.repository.delete(&existing.notification_id).await?;
            return Ok(ToggleOutcome::Retracted);
        }

        match self.repository.insert(&build_notification(&input)).await {
            Ok(notification) => {
                self.dispatch_delivery(notification.clone());
                Ok(ToggleOutcome::Created(notification))
            }
            Err(DomainError::Conflict) => {
                // A concurrent toggle won the insert; finish ours as the
                // off half instead of surfacing the constraint violation.
                if let Some(existing) = self.repository.find_active_by_dedup(&key).await? {
                    self.repository.delete(&existing.notification_id).await?;
                }
                Ok(ToggleOutcome::Retracted)
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes every record the filter matches. Absence is a valid outcome,
    /// not an error; callers may retract the same action twice.
    pub async fn retract(&self, filter: RetractFilter) -> DomainResult<usize> {
        if filter.actor_id.trim().is_empty() {
            return Err(DomainError::Validation("actor_id is required".into()));
        }
        self.repository.delete_matching(&filter).await
    }

    pub async fn list(&self, query: ListNotificationsQuery) -> DomainResult<Vec<Notification>> {
        validate_recipient_id(&query.recipient_id)?;
        let per_page = normalize_per_page(query.per_page)?;
        self.repository
            .list(&NotificationListQuery {
                recipient_id: query.recipient_id,
                unread_only: query.unread_only,
                excluded_kinds: query.excluded_kinds,
                offset: query.page.saturating_mul(per_page),
                limit: per_page,
            })
            .await
    }

    pub async fn count(
        &self,
        recipient_id: &str,
        read: bool,
        excluded_kinds: &[NotificationKind],
    ) -> DomainResult<usize> {
        validate_recipient_id(recipient_id)?;
        self.repository.count(recipient_id, read, excluded_kinds).await
    }

    pub async fn mark_read(
        &self,
        actor_id: &str,
        notification_id: &str,
    ) -> DomainResult<Notification> {
        validate_recipient_id(actor_id)?;
        let notification = self
            .repository
            .get(notification_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if notification.recipient_id != actor_id {
            return Err(DomainError::Forbidden(
                "notification belongs to another user".into(),
            ));
        }
        self.repository.set_read(notification_id, true).await
    }

    pub async fn mark_all_read(&self, recipient_id: &str) -> DomainResult<usize> {
        validate_recipient_id(recipient_id)?;
        self.repository.mark_all_read(recipient_id).await
    }

    /// Preference lookups fail open: a broken store must degrade to noisy
    /// delivery, not silently lost alerts.
    async fn is_suppressed(
        &self,
        user_id: &str,
        kind: NotificationKind,
        channel: NotificationChannel,
    ) -> bool {
        match self.preferences.is_suppressed(user_id, kind, channel).await {
            Ok(suppressed) => suppressed,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    user_id,
                    "preference lookup failed; treating kind as not suppressed"
                );
                false
            }
        }
    }

    /// Fire-and-forget hand-off to the external delivery channel. Runs after
    /// the ledger write committed; a delivery failure never rolls it back.
    fn dispatch_delivery(&self, notification: Notification) {
        let preferences = self.preferences.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let suppressed = match preferences
                .is_suppressed(
                    &notification.recipient_id,
                    notification.kind,
                    NotificationChannel::Email,
                )
                .await
            {
                Ok(suppressed) => suppressed,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        recipient_id = %notification.recipient_id,
                        "email preference lookup failed; delivering anyway"
                    );
                    false
                }
            };
            if suppressed {
                return;
            }
            if let Err(err) = dispatcher.deliver(&notification).await {
                tracing::warn!(
                    error = %err,
                    notification_id = %notification.notification_id,
                    "notification delivery failed"
                );
            }
        });
    }
}

fn build_notification(input: &NotificationCreate) -> Notification {
    Notification {
        notification_id: crate::util::uuid_v7_without_dashes(),
        kind: input.kind,
        recipient_id: input.recipient_id.clone(),
        actor_id: input.actor_id.clone(),
        post_id: input.post_id.clone(),
        comment_id: input.comment_id.clone(),
        reaction_kind: input.reaction_kind,
        content: input.content.clone(),
        approved: input.approved,
        read: false,
        created_at_ms: now_ms(),
    }
}

fn toggle_key(input: &NotificationCreate) -> DomainResult<DedupKey> {
    let actor_id = input
        .actor_id
        .clone()
        .ok_or_else(|| DomainError::Validation("actor_id is required for toggleable kinds".into()))?;
    Ok(DedupKey {
        kind: input.kind,
        actor_id,
        post_id: input.post_id.clone(),
        comment_id: input.comment_id.clone(),
        reaction_kind: input.reaction_kind,
    })
}

fn validate_notification_input(input: &NotificationCreate) -> DomainResult<()> {
    validate_recipient_id(&input.recipient_id)?;
    if input.kind == NotificationKind::Reaction && input.reaction_kind.is_none() {
        return Err(DomainError::InvalidReference(
            "reaction notifications require a reaction_kind".into(),
        ));
    }
    if input.reaction_kind.is_some() && input.kind != NotificationKind::Reaction {
        return Err(DomainError::InvalidReference(
            "reaction_kind is only valid for reaction notifications".into(),
        ));
    }
    if input.kind.is_toggleable() && input.actor_id.is_none() {
        return Err(DomainError::Validation(
            "actor_id is required for toggleable kinds".into(),
        ));
    }
    if let Some(content) = input.content.as_ref() {
        if content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(DomainError::Validation(format!(
                "content exceeds max length of {MAX_CONTENT_LENGTH}"
            )));
        }
    }
    Ok(())
}

fn validate_recipient_id(recipient_id: &str) -> DomainResult<()> {
    if recipient_id.trim().is_empty() {
        return Err(DomainError::Validation("recipient_id is required".into()));
    }
    Ok(())
}

fn normalize_per_page(per_page: Option<usize>) -> DomainResult<usize> {
    let per_page = per_page.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&per_page) {
        Err(DomainError::Validation(format!(
            "per_page must be between 1 and {MAX_PAGE_SIZE}"
        )))
    } else {
        Ok(per_page)
    }
}
