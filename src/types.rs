use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Title given to a conversation until its first user message arrives.
pub const NEW_CHAT_TITLE: &str = "New Chat";

const TITLE_MAX_CHARS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Wire shape of a message sent to the chat proxy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Persona selector forwarded to the proxy with every request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Friendly,
    Funny,
    Formal,
    Motivator,
    StudyBuddy,
}

impl ChatMode {
    pub const ALL: [ChatMode; 5] = [
        ChatMode::Friendly,
        ChatMode::Funny,
        ChatMode::Formal,
        ChatMode::Motivator,
        ChatMode::StudyBuddy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Friendly => "friendly",
            ChatMode::Funny => "funny",
            ChatMode::Formal => "formal",
            ChatMode::Motivator => "motivator",
            ChatMode::StudyBuddy => "studybuddy",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChatMode::Friendly => "Friendly",
            ChatMode::Funny => "Funny",
            ChatMode::Formal => "Formal",
            ChatMode::Motivator => "Motivator",
            ChatMode::StudyBuddy => "Study Buddy",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown chat mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for ChatMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ChatMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Identifier assigned to a conversation by the persistence layer.
    ConversationId
);
uuid_id!(
    /// Identifier assigned to a message by the persistence layer on save.
    MessageId
);

/// Whether a message exists only locally or has been saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Provisional { local_seq: u64 },
    Persisted { id: MessageId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: OffsetDateTime,
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Persisted { id } => Some(id),
            MessageKey::Provisional { .. } => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, MessageKey::Provisional { .. })
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub mode: ChatMode,
    pub updated_at: OffsetDateTime,
}

impl Conversation {
    pub fn has_default_title(&self) -> bool {
        self.title == NEW_CHAT_TITLE
    }
}

/// Label derived from the first user message: at most 50 characters,
/// suffixed with "..." when cut.
pub fn derive_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}
