use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::conversations::ConversationRepository;
use crate::util::now_ms;

const MAX_MESSAGE_LENGTH: usize = 2_000;
const MAX_CHANNEL_NAME_LENGTH: usize = 100;
const MAX_MESSAGES_PER_REQUEST: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub is_channel: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub created_at_ms: i64,
    /// Weak pointer into the message log, kept only for display ordering.
    /// Never an owning edge: the referenced message outlives nothing here.
    pub last_message_id: Option<String>,
    pub last_message_at_ms: Option<i64>,
}

impl Conversation {
    /// Display-ordering key: last message when there is one, creation time
    /// otherwise, so idle channels mix naturally with active conversations.
    pub fn activity_at_ms(&self) -> i64 {
        self.last_message_at_ms.unwrap_or(self.created_at_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    /// Read watermark. Unset means never read: every message counts.
    pub last_read_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ChannelCreate {
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SendMessageInput {
    pub conversation_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MessagePage {
    pub page: usize,
    pub per_page: usize,
}

pub fn build_message_page(page: Option<usize>, per_page: Option<usize>) -> MessagePage {
    MessagePage {
        page: page.unwrap_or(0),
        per_page: per_page.unwrap_or(50).clamp(1, MAX_MESSAGES_PER_REQUEST),
    }
}

#[derive(Clone)]
pub struct ConversationService {
    repository: Arc<dyn ConversationRepository>,
}

impl ConversationService {
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        Self { repository }
    }

    /// Returns the most recent direct conversation between the pair, or
    /// creates one with both participant records unread.
    pub async fn get_or_create_direct(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> DomainResult<Conversation> {
        validate_user_id(user_a)?;
        validate_user_id(user_b)?;
        if user_a == user_b {
            return Err(DomainError::Validation(
                "a direct conversation requires two distinct users".into(),
            ));
        }

        if let Some(existing) = self.repository.find_direct_conversation(user_a, user_b).await? {
            return Ok(existing);
        }

        let conversation = Conversation {
            conversation_id: crate::util::uuid_v7_without_dashes(),
            is_channel: false,
            name: None,
            description: None,
            avatar: None,
            created_at_ms: now_ms(),
            last_message_id: None,
            last_message_at_ms: None,
        };
        let conversation = self.repository.create_conversation(&conversation).await?;
        for user_id in [user_a, user_b] {
            self.repository
                .create_participant(&Participant {
                    conversation_id: conversation.conversation_id.clone(),
                    user_id: user_id.to_string(),
                    last_read_at_ms: None,
                })
                .await?;
        }
        Ok(conversation)
    }

    pub async fn create_channel(
        &self,
        creator: &ActorIdentity,
        input: ChannelCreate,
    ) -> DomainResult<Conversation> {
        validate_user_id(&creator.user_id)?;
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(DomainError::Validation("channel name is required".into()));
        }
        if name.chars().count() > MAX_CHANNEL_NAME_LENGTH {
            return Err(DomainError::Validation(format!(
                "channel name exceeds max length of {MAX_CHANNEL_NAME_LENGTH}"
            )));
        }

        let conversation = Conversation {
            conversation_id: crate::util::uuid_v7_without_dashes(),
            is_channel: true,
            name: Some(name),
            description: input.description,
            avatar: input.avatar,
            created_at_ms: now_ms(),
            last_message_id: None,
            last_message_at_ms: None,
        };
        let conversation = self.repository.create_conversation(&conversation).await?;
        self.repository
            .create_participant(&Participant {
                conversation_id: conversation.conversation_id.clone(),
                user_id: creator.user_id.clone(),
                last_read_at_ms: None,
            })
            .await?;
        Ok(conversation)
    }

    pub async fn join_channel(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Participant> {
        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if !conversation.is_channel {
            return Err(DomainError::Forbidden(
                "direct conversations cannot be joined".into(),
            ));
        }
        if let Some(existing) = self
            .repository
            .get_participant(conversation_id, &actor.user_id)
            .await?
        {
            return Ok(existing);
        }
        self.repository
            .create_participant(&Participant {
                conversation_id: conversation_id.to_string(),
                user_id: actor.user_id.clone(),
                last_read_at_ms: None,
            })
            .await
    }

    /// Leaving is a channel-only operation: a direct conversation always
    /// keeps its two participant records.
    pub async fn leave_channel(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<()> {
        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if !conversation.is_channel {
            return Err(DomainError::Forbidden(
                "direct conversations cannot be left".into(),
            ));
        }
        self.assert_participant(conversation_id, &actor.user_id).await?;
        self.repository
            .delete_participant(conversation_id, &actor.user_id)
            .await
    }

    pub async fn send_message(
        &self,
        sender: &ActorIdentity,
        input: SendMessageInput,
    ) -> DomainResult<Message> {
        let content = input.content.trim().to_string();
        validate_message_content(&content)?;

        let conversation = self
            .repository
            .get_conversation(&input.conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.assert_participant(&conversation.conversation_id, &sender.user_id)
            .await?;

        if let Some(reply_to_id) = input.reply_to_id.as_deref() {
            self.repository
                .get_message(&conversation.conversation_id, reply_to_id)
                .await?
                .ok_or_else(|| {
                    DomainError::InvalidReference(
                        "reply_to must reference a message in the same conversation".into(),
                    )
                })?;
        }

        let message = Message {
            message_id: crate::util::uuid_v7_without_dashes(),
            conversation_id: conversation.conversation_id.clone(),
            sender_id: sender.user_id.clone(),
            content,
            reply_to_id: input.reply_to_id,
            created_at_ms: now_ms(),
        };

        // The repository owns the append + last-message pointer as one
        // atomic unit; the returned timestamp is the effective, clamped one.
        let message = self.repository.append_message(&message).await?;

        // Sending implies having read the conversation up to this message.
        self.repository
            .advance_last_read(
                &message.conversation_id,
                &sender.user_id,
                message.created_at_ms,
            )
            .await?;
        Ok(message)
    }

    pub async fn mark_read(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Participant> {
        self.repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.assert_participant(conversation_id, &actor.user_id).await?;
        self.repository
            .advance_last_read(conversation_id, &actor.user_id, now_ms())
            .await
    }

    pub async fn unread_count(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<usize> {
        self.repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let participant = self
            .assert_participant(conversation_id, &actor.user_id)
            .await?;
        self.repository
            .count_messages_after(
                conversation_id,
                participant.last_read_at_ms,
                &actor.user_id,
            )
            .await
    }

    pub async fn list_conversations(
        &self,
        actor: &ActorIdentity,
    ) -> DomainResult<Vec<Conversation>> {
        validate_user_id(&actor.user_id)?;
        let mut conversations = self
            .repository
            .list_conversations_for_user(&actor.user_id)
            .await?;
        conversations.sort_by(|left, right| {
            right
                .activity_at_ms()
                .cmp(&left.activity_at_ms())
                .then_with(|| right.created_at_ms.cmp(&left.created_at_ms))
                .then_with(|| right.conversation_id.cmp(&left.conversation_id))
        });
        Ok(conversations)
    }

    pub async fn list_messages(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        page: MessagePage,
    ) -> DomainResult<Vec<Message>> {
        self.repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.assert_participant(conversation_id, &actor.user_id).await?;
        self.repository.list_messages(conversation_id, &page).await
    }

    pub async fn list_participants(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Vec<Participant>> {
        self.repository
            .get_conversation(conversation_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.assert_participant(conversation_id, &actor.user_id).await?;
        self.repository.list_participants(conversation_id).await
    }

    pub async fn list_channels(&self) -> DomainResult<Vec<Conversation>> {
        self.repository.list_channels().await
    }

    pub async fn channel_count(&self) -> DomainResult<usize> {
        self.repository.channel_count().await
    }

    async fn assert_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> DomainResult<Participant> {
        self.repository
            .get_participant(conversation_id, user_id)
            .await?
            .ok_or_else(|| {
                DomainError::Forbidden("user is not a participant of this conversation".into())
            })
    }
}

fn validate_user_id(user_id: &str) -> DomainResult<()> {
    if user_id.trim().is_empty() {
        return Err(DomainError::Validation("user_id is required".into()));
    }
    Ok(())
}

fn validate_message_content(content: &str) -> DomainResult<()> {
    if content.is_empty() {
        return Err(DomainError::Validation("content is required".into()));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(DomainError::Validation(format!(
            "content exceeds max length of {MAX_MESSAGE_LENGTH}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;
    use crate::ports::BoxFuture;

    #[derive(Default)]
    struct MockConversationRepo {
        conversations: Arc<RwLock<HashMap<String, Conversation>>>,
        participants: Arc<RwLock<HashMap<(String, String), Participant>>>,
        messages: Arc<RwLock<HashMap<(String, String), Message>>>,
    }

    impl ConversationRepository for MockConversationRepo {
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
                matches.sort_by(|left, right| right.created_at_ms.cmp(&left.created_at_ms));
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
                    .filter_map(|participant| {
                        conversations.get(&participant.conversation_id).cloned()
                    })
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
                let mut conversations = self.conversations.write().await;
                let conversation = conversations
                    .get_mut(&message.conversation_id)
                    .ok_or(DomainError::NotFound)?;
                if let Some(last_ms) = conversation.last_message_at_ms {
                    message.created_at_ms = message.created_at_ms.max(last_ms);
                }
                let mut messages = self.messages.write().await;
                messages.insert(
                    (message.conversation_id.clone(), message.message_id.clone()),
                    message.clone(),
                );
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

    fn service() -> (Arc<MockConversationRepo>, ConversationService) {
        let repo = Arc::new(MockConversationRepo::default());
        (repo.clone(), ConversationService::new(repo))
    }

    fn alice() -> ActorIdentity {
        ActorIdentity::with_user_id("alice")
    }

    fn bob() -> ActorIdentity {
        ActorIdentity::with_user_id("bob")
    }

    fn send_input(conversation_id: &str, content: &str) -> SendMessageInput {
        SendMessageInput {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn direct_conversation_is_reused() {
        let (_, service) = service();
        let first = service.get_or_create_direct("alice", "bob").await.expect("create");
        let second = service.get_or_create_direct("bob", "alice").await.expect("reuse");
        assert_eq!(first.conversation_id, second.conversation_id);
        assert!(!first.is_channel);
    }

    #[tokio::test]
    async fn direct_conversation_picks_most_recent_of_duplicates() {
        let (repo, service) = service();
        for (conversation_id, created_at_ms) in [("conv-old", 1_000), ("conv-new", 2_000)] {
            repo.create_conversation(&Conversation {
                conversation_id: conversation_id.to_string(),
                is_channel: false,
                name: None,
                description: None,
                avatar: None,
                created_at_ms,
                last_message_id: None,
                last_message_at_ms: None,
            })
            .await
            .expect("conversation");
            for user_id in ["alice", "bob"] {
                repo.create_participant(&Participant {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                    last_read_at_ms: None,
                })
                .await
                .expect("participant");
            }
        }

        let found = service.get_or_create_direct("alice", "bob").await.expect("lookup");
        assert_eq!(found.conversation_id, "conv-new");
    }

    #[tokio::test]
    async fn direct_conversation_ignores_wider_groups() {
        let (repo, service) = service();
        repo.create_conversation(&Conversation {
            conversation_id: "trio".to_string(),
            is_channel: false,
            name: None,
            description: None,
            avatar: None,
            created_at_ms: 1_000,
            last_message_id: None,
            last_message_at_ms: None,
        })
        .await
        .expect("conversation");
        for user_id in ["alice", "bob", "carol"] {
            repo.create_participant(&Participant {
                conversation_id: "trio".to_string(),
                user_id: user_id.to_string(),
                last_read_at_ms: None,
            })
            .await
            .expect("participant");
        }

        let created = service.get_or_create_direct("alice", "bob").await.expect("fresh");
        assert_ne!(created.conversation_id, "trio");
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (_, service) = service();
        let err = service.get_or_create_direct("alice", "alice").await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn send_requires_membership() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let err = service
            .send_message(
                &ActorIdentity::with_user_id("mallory"),
                send_input(&conversation.conversation_id, "hi"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden(_)));
    }

    #[tokio::test]
    async fn send_updates_last_message_pointer() {
        let (repo, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");

        let message = service
            .send_message(&alice(), send_input(&conversation.conversation_id, "hi"))
            .await
            .expect("send");

        let stored = repo
            .get_conversation(&conversation.conversation_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.last_message_id.as_deref(), Some(message.message_id.as_str()));
        assert_eq!(stored.last_message_at_ms, Some(message.created_at_ms));
    }

    #[tokio::test]
    async fn reply_to_must_live_in_same_conversation() {
        let (_, service) = service();
        let first = service.get_or_create_direct("alice", "bob").await.expect("first");
        let other = service.get_or_create_direct("alice", "carol").await.expect("second");
        let foreign = service
            .send_message(&alice(), send_input(&other.conversation_id, "elsewhere"))
            .await
            .expect("foreign message");

        let err = service
            .send_message(
                &alice(),
                SendMessageInput {
                    conversation_id: first.conversation_id.clone(),
                    content: "reply".to_string(),
                    reply_to_id: Some(foreign.message_id),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn reply_to_within_conversation_is_kept() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let original = service
            .send_message(&alice(), send_input(&conversation.conversation_id, "hi"))
            .await
            .expect("original");
        let reply = service
            .send_message(
                &bob(),
                SendMessageInput {
                    conversation_id: conversation.conversation_id.clone(),
                    content: "hello back".to_string(),
                    reply_to_id: Some(original.message_id.clone()),
                },
            )
            .await
            .expect("reply");
        assert_eq!(reply.reply_to_id.as_deref(), Some(original.message_id.as_str()));
    }

    #[tokio::test]
    async fn unread_flow_matches_read_watermarks() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let conversation_id = conversation.conversation_id.as_str();

        service
            .send_message(&alice(), send_input(conversation_id, "hi"))
            .await
            .expect("m1");
        assert_eq!(service.unread_count(&bob(), conversation_id).await.expect("b"), 1);
        assert_eq!(service.unread_count(&alice(), conversation_id).await.expect("a"), 0);

        service.mark_read(&bob(), conversation_id).await.expect("read");
        assert_eq!(service.unread_count(&bob(), conversation_id).await.expect("b"), 0);

        service
            .send_message(&alice(), send_input(conversation_id, "again"))
            .await
            .expect("m2");
        assert_eq!(service.unread_count(&bob(), conversation_id).await.expect("b"), 1);
    }

    #[tokio::test]
    async fn own_messages_never_count_as_unread() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let conversation_id = conversation.conversation_id.as_str();

        for content in ["one", "two", "three"] {
            service
                .send_message(&alice(), send_input(conversation_id, content))
                .await
                .expect("send");
        }
        assert_eq!(service.unread_count(&alice(), conversation_id).await.expect("a"), 0);
        assert_eq!(service.unread_count(&bob(), conversation_id).await.expect("b"), 3);
    }

    #[tokio::test]
    async fn stale_read_watermark_never_regresses() {
        let (repo, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let conversation_id = conversation.conversation_id.as_str();

        let message = service
            .send_message(&alice(), send_input(conversation_id, "hi"))
            .await
            .expect("send");
        service.mark_read(&bob(), conversation_id).await.expect("read");
        let fresh = repo
            .get_participant(conversation_id, "bob")
            .await
            .expect("get")
            .expect("present");
        let watermark = fresh.last_read_at_ms.expect("set");
        assert!(watermark >= message.created_at_ms);

        // A stale client replaying an old timestamp must be a no-op.
        let replayed = repo
            .advance_last_read(conversation_id, "bob", message.created_at_ms - 10_000)
            .await
            .expect("replay");
        assert_eq!(replayed.last_read_at_ms, Some(watermark));
        assert_eq!(service.unread_count(&bob(), conversation_id).await.expect("b"), 0);
    }

    #[tokio::test]
    async fn mark_read_requires_membership() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let err = service
            .mark_read(&ActorIdentity::with_user_id("mallory"), &conversation.conversation_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden(_)));
    }

    #[tokio::test]
    async fn conversation_list_orders_by_activity() {
        let (repo, service) = service();
        let chatty = service.get_or_create_direct("alice", "bob").await.expect("chatty");
        let quiet = service
            .create_channel(
                &alice(),
                ChannelCreate {
                    name: "announcements".to_string(),
                    description: None,
                    avatar: None,
                },
            )
            .await
            .expect("channel");

        // Force deterministic stamps: the idle channel is newest by creation,
        // the direct conversation newest by last message.
        {
            let mut conversations = repo.conversations.write().await;
            conversations.get_mut(&chatty.conversation_id).unwrap().created_at_ms = 1_000;
            conversations.get_mut(&quiet.conversation_id).unwrap().created_at_ms = 5_000;
        }
        service
            .send_message(&alice(), send_input(&chatty.conversation_id, "ping"))
            .await
            .expect("send");

        let listed = service.list_conversations(&alice()).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].conversation_id, chatty.conversation_id);
        assert_eq!(listed[1].conversation_id, quiet.conversation_id);
        assert!(listed[0].activity_at_ms() >= listed[1].activity_at_ms());
    }

    #[tokio::test]
    async fn channel_creation_seeds_creator_membership() {
        let (_, service) = service();
        let channel = service
            .create_channel(
                &alice(),
                ChannelCreate {
                    name: "general".to_string(),
                    description: Some("open floor".to_string()),
                    avatar: None,
                },
            )
            .await
            .expect("channel");
        assert!(channel.is_channel);

        let participants = service
            .list_participants(&alice(), &channel.conversation_id)
            .await
            .expect("participants");
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, "alice");
        assert_eq!(service.channel_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn join_channel_is_idempotent_and_direct_is_closed() {
        let (_, service) = service();
        let channel = service
            .create_channel(
                &alice(),
                ChannelCreate {
                    name: "general".to_string(),
                    description: None,
                    avatar: None,
                },
            )
            .await
            .expect("channel");

        service.join_channel(&bob(), &channel.conversation_id).await.expect("join");
        let again = service
            .join_channel(&bob(), &channel.conversation_id)
            .await
            .expect("rejoin");
        assert_eq!(again.user_id, "bob");

        service.leave_channel(&bob(), &channel.conversation_id).await.expect("leave");
        let participants = service
            .list_participants(&alice(), &channel.conversation_id)
            .await
            .expect("participants");
        assert_eq!(participants.len(), 1);

        let direct = service.get_or_create_direct("alice", "bob").await.expect("direct");
        let err = service
            .join_channel(&ActorIdentity::with_user_id("carol"), &direct.conversation_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden(_)));
    }

    #[tokio::test]
    async fn messages_replay_in_ascending_order() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let conversation_id = conversation.conversation_id.as_str();
        for content in ["first", "second", "third"] {
            service
                .send_message(&alice(), send_input(conversation_id, content))
                .await
                .expect("send");
        }

        let messages = service
            .list_messages(&bob(), conversation_id, build_message_page(None, None))
            .await
            .expect("list");
        let contents: Vec<&str> = messages.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(
            messages
                .windows(2)
                .all(|pair| pair[0].created_at_ms <= pair[1].created_at_ms)
        );
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (_, service) = service();
        let conversation = service.get_or_create_direct("alice", "bob").await.expect("create");
        let err = service
            .send_message(&alice(), send_input(&conversation.conversation_id, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
