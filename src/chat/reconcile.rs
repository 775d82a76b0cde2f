//! Merging of locally streamed and persisted messages.
//!
//! A conversation's list holds persisted rows ordered by creation time and
//! at most one provisional assistant entry, always at the tail. Persisted
//! rows may arrive from a local insert or from the push subscription, in any
//! order relative to the provisional updates, so every merge is idempotent.

use crate::types::{ChatMessage, ConversationId, Message, MessageKey, Role};
use time::{Duration, OffsetDateTime};

/// Clock skew tolerated between the local provisional timestamp and the
/// store-assigned one.
const ADJACENCY_SKEW: Duration = Duration::seconds(30);

/// Outcome of merging a persisted row into the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Merge {
    /// Row was already present.
    Duplicate,
    /// Provisional tail took over the row's identity.
    Adopted,
    /// Provisional tail was replaced by the local turn's saved reply.
    Replaced,
    Inserted,
    /// Row carried no identifier.
    Ignored,
}

#[derive(Clone, Debug, Default)]
pub struct MessageList {
    entries: Vec<Message>,
    next_local_seq: u64,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_persisted(rows: impl IntoIterator<Item = Message>) -> Self {
        let mut list = Self::new();
        for row in rows {
            list.merge_persisted(row);
        }
        list
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn provisional(&self) -> Option<&Message> {
        self.entries.last().filter(|m| m.is_provisional())
    }

    /// History sent upstream: saved messages only, so unsent text is never
    /// echoed back to the model.
    pub fn persisted_history(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter(|m| !m.is_provisional())
            .map(Message::to_chat_message)
            .collect()
    }

    /// Replace the provisional assistant tail's content, or start one.
    pub fn upsert_provisional(
        &mut self,
        conversation_id: ConversationId,
        content: &str,
        now: OffsetDateTime,
    ) -> &Message {
        let has_tail = matches!(
            self.entries.last(),
            Some(Message {
                key: MessageKey::Provisional { .. },
                role: Role::Assistant,
                ..
            })
        );
        if !has_tail {
            let local_seq = self.next_local_seq;
            self.next_local_seq += 1;
            self.entries.push(Message {
                key: MessageKey::Provisional { local_seq },
                conversation_id,
                role: Role::Assistant,
                content: String::new(),
                created_at: now,
            });
        }

        let last = self.entries.len() - 1;
        let tail = &mut self.entries[last];
        tail.content.clear();
        tail.content.push_str(content);
        tail
    }

    /// Merge a persisted row delivered by the store or its push channel.
    pub fn merge_persisted(&mut self, row: Message) -> Merge {
        self.merge(row, false)
    }

    /// Reconcile the provisional tail with the saved copy of the local
    /// turn's reply.
    pub fn finalize_provisional(&mut self, row: Message) -> Merge {
        self.merge(row, true)
    }

    /// Drop a provisional tail left behind by a failed turn.
    pub fn discard_provisional(&mut self) -> Option<Message> {
        if self.provisional().is_some() {
            self.entries.pop()
        } else {
            None
        }
    }

    fn merge(&mut self, row: Message, own_reply: bool) -> Merge {
        let Some(id) = row.id() else {
            tracing::warn!("ignoring merge of a message without an identifier");
            return Merge::Ignored;
        };
        if self.entries.iter().any(|m| m.id() == Some(id)) {
            return Merge::Duplicate;
        }

        let mut outcome = Merge::Inserted;
        if let Some(tail) = self.entries.last_mut().filter(|m| m.is_provisional()) {
            if is_adjacent(tail, &row) {
                *tail = row;
                return Merge::Adopted;
            }
            if own_reply && tail.role == row.role {
                // The saved copy may sort before rows merged while streaming.
                self.entries.pop();
                outcome = Merge::Replaced;
            }
        }

        self.insert_ordered(row);
        outcome
    }

    /// Insert among the persisted rows by creation time, ahead of any
    /// provisional tail.
    fn insert_ordered(&mut self, row: Message) {
        let persisted_end = if self.provisional().is_some() {
            self.entries.len() - 1
        } else {
            self.entries.len()
        };
        let pos = self.entries[..persisted_end].partition_point(|m| m.created_at <= row.created_at);
        self.entries.insert(pos, row);
    }
}

fn is_adjacent(provisional: &Message, row: &Message) -> bool {
    provisional.conversation_id == row.conversation_id
        && provisional.role == row.role
        && row.created_at + ADJACENCY_SKEW >= provisional.created_at
        && row.content.starts_with(&provisional.content)
}
