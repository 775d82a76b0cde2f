use super::{ChatStore, StoreError, StoreResult, Subscription};
use crate::types::{
    ChatMode, Conversation, ConversationId, Message, MessageId, MessageKey, Role,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// In-process store with the same ordering and push semantics as the
/// hosted backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("store lock poisoned: {e}")))
    }
}

impl Tables {
    fn conversation_mut(&mut self, id: ConversationId) -> StoreResult<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn publish(&mut self, message: &Message) {
        if let Some(senders) = self.subscribers.get_mut(&message.conversation_id) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

fn not_found(id: ConversationId) -> StoreError {
    StoreError::NotFound {
        kind: "conversation",
        id: id.to_string(),
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_conversation(&self, title: &str, mode: ChatMode) -> StoreResult<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new(),
            title: title.to_string(),
            mode,
            updated_at: OffsetDateTime::now_utc(),
        };
        self.tables()?.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let mut conversations = self.tables()?.conversations.clone();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation> {
        self.tables()?
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn rename_conversation(&self, id: ConversationId, title: &str) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let conversation = tables.conversation_mut(id)?;
        conversation.title = title.to_string();
        conversation.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_conversation_mode(&self, id: ConversationId, mode: ChatMode) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let conversation = tables.conversation_mut(id)?;
        conversation.mode = mode;
        conversation.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> StoreResult<Message> {
        let mut tables = self.tables()?;
        let now = OffsetDateTime::now_utc();
        tables.conversation_mut(conversation_id)?.updated_at = now;

        let message = Message {
            key: MessageKey::Persisted {
                id: MessageId::new(),
            },
            conversation_id,
            role,
            content: content.to_string(),
            created_at: now,
        };
        tables.messages.push(message.clone());
        tables.publish(&message);
        tracing::trace!(%conversation_id, ?role, "message saved");
        Ok(message)
    }

    async fn subscribe(&self, conversation_id: ConversationId) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tables()?
            .subscribers
            .entry(conversation_id)
            .or_default()
            .push(tx);
        Ok(Subscription::new(conversation_id, rx))
    }
}
