use crate::DomainResult;
use crate::conversations::{Conversation, Message, MessagePage, Participant};
use crate::ports::BoxFuture;

pub trait ConversationRepository: Send + Sync {
    fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> BoxFuture<'_, DomainResult<Conversation>>;

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>>;

    /// The most recently created non-channel conversation whose participant
    /// set is exactly {user_a, user_b}. Older pairs between the same two
    /// users are preserved, never collapsed.
    fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Conversation>>>;

    fn list_conversations_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Conversation>>>;

    fn list_channels(&self) -> BoxFuture<'_, DomainResult<Vec<Conversation>>>;

    fn channel_count(&self) -> BoxFuture<'_, DomainResult<usize>>;

    /// Unique on (conversation_id, user_id); a duplicate is a Conflict.
    fn create_participant(
        &self,
        participant: &Participant,
    ) -> BoxFuture<'_, DomainResult<Participant>>;

    fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Participant>>>;

    /// Removes the participant record. The conversation itself stays.
    fn delete_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<()>>;

    fn list_participants(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<Participant>>>;

    /// Monotonic watermark write: the stored value becomes
    /// max(current, read_at_ms). A stale timestamp never regresses it.
    fn advance_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Participant>>;

    /// Atomic append. The message timestamp is clamped to be >= the
    /// conversation's current last-message timestamp, the row is inserted,
    /// and the conversation's last-message pointer is advanced in the same
    /// unit. Under concurrent sends the pointer must end at the message with
    /// the greatest committed timestamp (timestamp comparison, not
    /// last-write-wins). Returns the message with its effective timestamp.
    fn append_message(&self, message: &Message) -> BoxFuture<'_, DomainResult<Message>>;

    fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Message>>>;

    /// Ascending by (created_at, message_id), windowed by page.
    fn list_messages(
        &self,
        conversation_id: &str,
        page: &MessagePage,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>>;

    /// Messages strictly newer than `after_ms` (`None` counts everything),
    /// excluding those sent by `excluding_sender`.
    fn count_messages_after(
        &self,
        conversation_id: &str,
        after_ms: Option<i64>,
        excluding_sender: &str,
    ) -> BoxFuture<'_, DomainResult<usize>>;
}
