//! Persistence collaborator: conversations, messages and push updates.

mod memory;

pub use memory::MemoryStore;

use crate::types::{ChatMode, Conversation, ConversationId, Message, Role};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of message rows inserted into one conversation after subscribing.
pub struct Subscription {
    conversation_id: ConversationId,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(conversation_id: ConversationId, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            conversation_id,
            rx,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Next inserted row, or `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(&self, title: &str, mode: ChatMode) -> StoreResult<Conversation>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>>;

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation>;

    async fn rename_conversation(&self, id: ConversationId, title: &str) -> StoreResult<()>;

    async fn set_conversation_mode(&self, id: ConversationId, mode: ChatMode) -> StoreResult<()>;

    /// Oldest first.
    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>>;

    /// Save a message, assigning its identifier and timestamp. Subscribers of
    /// the conversation receive the saved row.
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> StoreResult<Message>;

    async fn subscribe(&self, conversation_id: ConversationId) -> StoreResult<Subscription>;
}
