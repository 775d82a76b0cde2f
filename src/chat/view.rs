use crate::types::{Conversation, Message};

/// Toast-style message shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Rendering surface driven by the [`ChatController`](super::ChatController).
pub trait ChatView {
    /// Full message list of the selected conversation, provisional tail
    /// included.
    fn render(&mut self, conversation: &Conversation, messages: &[Message]);

    fn set_loading(&mut self, loading: bool);

    fn notify(&mut self, notice: Notice);

    fn conversations_changed(&mut self, _conversations: &[Conversation]) {}
}
