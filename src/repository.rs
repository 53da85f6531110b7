//! Conversation/Branch Store contract (§4.7): the core depends only on
//! this trait, never on a storage substrate. An in-memory implementation
//! is provided for tests and as a reference for the contract's atomicity
//! requirements.

use crate::context::truncate_to_budget;
use crate::model::{Conversation, ConversationId, Message, ToolInvocation, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Storage-substrate-agnostic conversation log with fork semantics.
///
/// Implementors guarantee a total order on messages within a conversation
/// and an atomic `append_message`; the core never inspects the encoding
/// behind these operations.
#[async_trait]
pub trait Repository: Send + Sync {
    /// The most recent messages of a conversation, truncated to fit
    /// `max_tokens` (§4.7), oldest-first.
    async fn load_conversation_tail(&self, conversation_id: ConversationId, max_tokens: usize) -> crate::Result<Vec<Message>>;

    /// Appends one message to a conversation's total order.
    async fn append_message(&self, conversation_id: ConversationId, message: Message) -> crate::Result<()>;

    /// Forks `conversation_id` at `anchor_message_id`: the new conversation
    /// shares the prefix up to and including the anchor *by reference* and
    /// becomes the new append target going forward.
    async fn fork(
        &self,
        conversation_id: ConversationId,
        anchor_message_id: crate::model::MessageId,
        label: String,
    ) -> crate::Result<ConversationId>;

    /// Appends one tool-invocation audit row (§4.2 step 6, §6 "audit log
    /// of tool invocations"). Never fails the turn it's called from; a
    /// write failure here is a storage concern, not a conversation one.
    async fn record_tool_invocation(&self, invocation: ToolInvocation) -> crate::Result<()>;
}

/// Reference implementation used by tests (§9 "the core does not specify
/// the storage substrate" — this is one substrate, not the contract).
#[derive(Default)]
pub struct InMemoryRepository {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    tool_invocations: Mutex<Vec<ToolInvocation>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a conversation directly, bypassing `append_message`, for
    /// test setup.
    pub async fn seed(&self, conversation: Conversation) {
        self.conversations.lock().await.insert(conversation.id, conversation);
    }

    pub async fn owner_of(&self, conversation_id: ConversationId) -> Option<UserId> {
        self.conversations.lock().await.get(&conversation_id).map(|c| c.owner)
    }

    /// Audit rows recorded so far, oldest first. Test/inspection only —
    /// a real substrate would expose this as a query, not a full dump.
    pub async fn tool_invocations(&self) -> Vec<ToolInvocation> {
        self.tool_invocations.lock().await.clone()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_conversation_tail(&self, conversation_id: ConversationId, max_tokens: usize) -> crate::Result<Vec<Message>> {
        let conversations = self.conversations.lock().await;
        let conversation = conversations
            .get(&conversation_id)
            .ok_or_else(|| crate::Error::invalid_input(format!("unknown conversation {conversation_id}")))?;
        Ok(truncate_to_budget(&conversation.messages, max_tokens))
    }

    async fn append_message(&self, conversation_id: ConversationId, message: Message) -> crate::Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| crate::Error::invalid_input(format!("unknown conversation {conversation_id}")))?;
        conversation.messages.push(message);
        Ok(())
    }

    async fn fork(
        &self,
        conversation_id: ConversationId,
        anchor_message_id: crate::model::MessageId,
        _label: String,
    ) -> crate::Result<ConversationId> {
        let mut conversations = self.conversations.lock().await;
        let source = conversations
            .get(&conversation_id)
            .ok_or_else(|| crate::Error::invalid_input(format!("unknown conversation {conversation_id}")))?;

        let anchor_position = source
            .messages
            .iter()
            .position(|m| m.id == anchor_message_id)
            .ok_or_else(|| crate::Error::invalid_input(format!("unknown anchor message {anchor_message_id}")))?;

        let mut fork = Conversation::new(source.owner);
        fork.parent_conversation_id = Some(source.id);
        fork.fork_anchor_message_id = Some(anchor_message_id);
        fork.messages = source.messages[..=anchor_position].to_vec();

        let fork_id = fork.id;
        conversations.insert(fork_id, fork);
        Ok(fork_id)
    }

    async fn record_tool_invocation(&self, invocation: ToolInvocation) -> crate::Result<()> {
        self.tool_invocations.lock().await.push(invocation);
        Ok(())
    }
}

/// Shared handle suitable for passing to the orchestrator and the council
/// engine without duplicating storage.
pub type SharedRepository = Arc<dyn Repository>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentBlock;

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let repo = InMemoryRepository::new();
        let conversation = Conversation::new(UserId::new());
        let conversation_id = conversation.id;
        repo.seed(conversation).await;

        let message = Message::user(conversation_id, "hello");
        repo.append_message(conversation_id, message.clone()).await.unwrap();

        let tail = repo.load_conversation_tail(conversation_id, 10_000).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, message.id);
    }

    #[tokio::test]
    async fn load_truncates_to_the_token_budget() {
        let repo = InMemoryRepository::new();
        let conversation = Conversation::new(UserId::new());
        let conversation_id = conversation.id;
        repo.seed(conversation).await;

        for i in 0..50 {
            repo.append_message(conversation_id, Message::user(conversation_id, format!("message {i}")))
                .await
                .unwrap();
        }

        let tail = repo.load_conversation_tail(conversation_id, 50).await.unwrap();
        assert!(tail.len() < 50);
    }

    #[tokio::test]
    async fn fork_shares_the_prefix_up_to_the_anchor() {
        let repo = InMemoryRepository::new();
        let owner = UserId::new();
        let conversation = Conversation::new(owner);
        let conversation_id = conversation.id;
        repo.seed(conversation).await;

        let first = Message::user(conversation_id, "one");
        let anchor = Message::user(conversation_id, "two");
        let third = Message::user(conversation_id, "three");
        let anchor_id = anchor.id;

        repo.append_message(conversation_id, first).await.unwrap();
        repo.append_message(conversation_id, anchor).await.unwrap();
        repo.append_message(conversation_id, third).await.unwrap();

        let fork_id = repo.fork(conversation_id, anchor_id, "branch".into()).await.unwrap();
        let fork_tail = repo.load_conversation_tail(fork_id, 10_000).await.unwrap();

        assert_eq!(fork_tail.len(), 2);
        assert_eq!(fork_tail[1].id, anchor_id);
        assert!(fork_tail
            .iter()
            .all(|m| matches!(&m.content[0], ContentBlock::Text(_))));
        assert_eq!(repo.owner_of(fork_id).await, Some(owner));
    }

    #[tokio::test]
    async fn record_tool_invocation_accumulates_audit_rows() {
        let repo = InMemoryRepository::new();
        let conversation_id = ConversationId::new();
        let invocation = ToolInvocation::start(
            crate::model::CallId::from("call_1"),
            crate::model::ToolId::from("echo"),
            UserId::new(),
            conversation_id,
            crate::model::AgentId::new(),
            "{}".into(),
        );
        repo.record_tool_invocation(invocation).await.unwrap();
        assert_eq!(repo.tool_invocations().await.len(), 1);
    }

    #[tokio::test]
    async fn fork_then_append_matches_a_fresh_conversation_with_the_same_messages() {
        let repo = InMemoryRepository::new();
        let conversation = Conversation::new(UserId::new());
        let conversation_id = conversation.id;
        repo.seed(conversation).await;

        let anchor = Message::user(conversation_id, "anchor");
        let anchor_id = anchor.id;
        repo.append_message(conversation_id, anchor).await.unwrap();

        let fork_id = repo.fork(conversation_id, anchor_id, "branch".into()).await.unwrap();
        let appended = Message::user(fork_id, "branch message");
        repo.append_message(fork_id, appended.clone()).await.unwrap();

        let fork_tail = repo.load_conversation_tail(fork_id, 10_000).await.unwrap();
        assert_eq!(fork_tail.len(), 2);
        assert_eq!(fork_tail[1].id, appended.id);
    }
}
