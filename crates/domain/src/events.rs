use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::notifications::{
    NotificationCreate, NotificationKind, NotificationService, ReactionKind,
};
use crate::ports::notifications::{ContentDirectory, RetractFilter};

/// Domain actions the surrounding platform reports into the ledger. Closed
/// set: adding an action without handling it is a compile error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    PostReacted {
        actor_id: String,
        post_id: String,
        reaction: ReactionKind,
    },
    CommentReacted {
        actor_id: String,
        comment_id: String,
        reaction: ReactionKind,
    },
    CommentReplied {
        actor_id: String,
        comment_id: String,
        preview: Option<String>,
    },
    UserFollowed {
        actor_id: String,
        target_user_id: String,
    },
    UserUnfollowed {
        actor_id: String,
        target_user_id: String,
    },
    PostSubscribed {
        actor_id: String,
        post_id: String,
        post_author_id: String,
    },
    PostUnsubscribed {
        actor_id: String,
        post_id: String,
        post_author_id: String,
    },
    Mentioned {
        actor_id: String,
        target_user_id: String,
        post_id: Option<String>,
        comment_id: Option<String>,
    },
}

/// Routes each domain action onto the ledger. Together with the two domain
/// services this is the only authorized mutation path into the four tables.
#[derive(Clone)]
pub struct EventFanout {
    notifications: NotificationService,
    directory: Arc<dyn ContentDirectory>,
}

impl EventFanout {
    pub fn new(notifications: NotificationService, directory: Arc<dyn ContentDirectory>) -> Self {
        Self {
            notifications,
            directory,
        }
    }

    pub async fn handle(&self, event: DomainEvent) -> DomainResult<()> {
        match event {
            DomainEvent::PostReacted {
                actor_id,
                post_id,
                reaction,
            } => {
                let post = self
                    .directory
                    .get_post(&post_id)
                    .await?
                    .ok_or(DomainError::NotFound)?;
                if post.author_id == actor_id {
                    return Ok(());
                }
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::Reaction,
                        recipient_id: post.author_id,
                        actor_id: Some(actor_id),
                        post_id: Some(post_id),
                        comment_id: None,
                        reaction_kind: Some(reaction),
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::CommentReacted {
                actor_id,
                comment_id,
                reaction,
            } => {
                let comment = self
                    .directory
                    .get_comment(&comment_id)
                    .await?
                    .ok_or(DomainError::NotFound)?;
                if comment.author_id == actor_id {
                    return Ok(());
                }
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::Reaction,
                        recipient_id: comment.author_id,
                        actor_id: Some(actor_id),
                        post_id: Some(comment.post_id),
                        comment_id: Some(comment_id),
                        reaction_kind: Some(reaction),
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::CommentReplied {
                actor_id,
                comment_id,
                preview,
            } => {
                let comment = self
                    .directory
                    .get_comment(&comment_id)
                    .await?
                    .ok_or(DomainError::NotFound)?;
                if comment.author_id == actor_id {
                    return Ok(());
                }
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::CommentReply,
                        recipient_id: comment.author_id,
                        actor_id: Some(actor_id),
                        post_id: Some(comment.post_id),
                        comment_id: Some(comment_id),
                        reaction_kind: None,
                        content: preview,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::UserFollowed {
                actor_id,
                target_user_id,
            } => {
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::UserFollowed,
                        recipient_id: target_user_id,
                        actor_id: Some(actor_id),
                        post_id: None,
                        comment_id: None,
                        reaction_kind: None,
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::UserUnfollowed {
                actor_id,
                target_user_id,
            } => {
                // The follow record goes away independent of the toggle
                // path, then the unfollow gets its own (non-toggleable)
                // record, mirroring the follow/unfollow pair of kinds.
                self.notifications
                    .retract(RetractFilter {
                        kind: NotificationKind::UserFollowed,
                        actor_id: actor_id.clone(),
                        post_id: None,
                        comment_id: None,
                        reaction_kind: None,
                    })
                    .await?;
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::UserUnfollowed,
                        recipient_id: target_user_id,
                        actor_id: Some(actor_id),
                        post_id: None,
                        comment_id: None,
                        reaction_kind: None,
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::PostSubscribed {
                actor_id,
                post_id,
                post_author_id,
            } => {
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::PostSubscribed,
                        recipient_id: post_author_id,
                        actor_id: Some(actor_id),
                        post_id: Some(post_id),
                        comment_id: None,
                        reaction_kind: None,
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::PostUnsubscribed {
                actor_id,
                post_id,
                post_author_id,
            } => {
                self.notifications
                    .retract(RetractFilter {
                        kind: NotificationKind::PostSubscribed,
                        actor_id: actor_id.clone(),
                        post_id: Some(post_id.clone()),
                        comment_id: None,
                        reaction_kind: None,
                    })
                    .await?;
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::PostUnsubscribed,
                        recipient_id: post_author_id,
                        actor_id: Some(actor_id),
                        post_id: Some(post_id),
                        comment_id: None,
                        reaction_kind: None,
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
            DomainEvent::Mentioned {
                actor_id,
                target_user_id,
                post_id,
                comment_id,
            } => {
                self.notifications
                    .create_or_toggle(NotificationCreate {
                        kind: NotificationKind::Mention,
                        recipient_id: target_user_id,
                        actor_id: Some(actor_id),
                        post_id,
                        comment_id,
                        reaction_kind: None,
                        content: None,
                        approved: None,
                    })
                    .await?;
                Ok(())
            }
        }
    }
}
