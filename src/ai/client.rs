use crate::auth::TokenProvider;
use crate::chat::Notice;
use crate::config::ChatConfig;
use crate::store::StoreError;
use crate::types::{ChatMessage, ChatMode};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::sse::decode_stream;

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("payment required")]
    PaymentRequired,

    #[error("failed to start stream: {0}")]
    StreamStartFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

impl ChatError {
    /// User-facing notice shown when a turn ends with this error.
    pub fn notice(&self) -> Notice {
        match self {
            ChatError::RateLimited => Notice::new(
                "Rate Limit Exceeded",
                "Too many requests. Please try again later.",
            ),
            ChatError::PaymentRequired => {
                Notice::new("Payment Required", "Please add funds to your workspace.")
            }
            ChatError::Persistence(_) => Notice::new("Error", "Failed to save message"),
            _ => Notice::new("Error", "Failed to send message. Please try again."),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Fragments of one streamed reply, in arrival order.
pub type FragmentStream = BoxStream<'static, ChatResult<String>>;

// ============================================
// Turn Events
// ============================================

#[derive(Debug)]
pub enum TurnEvent {
    Fragment(String),
    Failed(ChatError),
    /// Always the last event of a turn, after any `Failed`.
    Done,
}

pub type TurnEvents = mpsc::UnboundedReceiver<TurnEvent>;

// ============================================
// Proxy Client
// ============================================

#[derive(Serialize)]
struct ProxyRequest<'a> {
    messages: &'a [ChatMessage],
    mode: ChatMode,
}

/// Client for the `/chat` proxy that relays the model gateway's stream.
#[derive(Clone)]
pub struct ProxyClient {
    client: Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ProxyClient {
    pub fn new(config: &ChatConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_endpoint(config.chat_endpoint(), tokens)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            tokens,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send the request and hand back the decoded fragment stream.
    ///
    /// Status failures are mapped before any body is read.
    pub async fn open(&self, messages: &[ChatMessage], mode: ChatMode) -> ChatResult<FragmentStream> {
        tracing::debug!(
            endpoint = %self.endpoint,
            messages = messages.len(),
            %mode,
            "opening chat stream"
        );

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(&ProxyRequest { messages, mode });
        if let Some(token) = self.tokens.access_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        match status {
            StatusCode::TOO_MANY_REQUESTS => return Err(ChatError::RateLimited),
            StatusCode::PAYMENT_REQUIRED => return Err(ChatError::PaymentRequired),
            _ => {}
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::StreamStartFailed(format!(
                "proxy returned {status}: {body}"
            )));
        }
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(ChatError::StreamStartFailed("no response body".to_string()));
        }

        let fragments = decode_stream(response.bytes_stream())
            .map(|item| item.map_err(ChatError::from))
            .boxed();
        Ok(fragments)
    }

    /// Stream one reply through callbacks.
    ///
    /// `on_done` runs exactly once on every path, including status and
    /// read failures, so callers can always clear their loading state.
    pub async fn stream_chat<F, D>(
        &self,
        messages: &[ChatMessage],
        mode: ChatMode,
        on_fragment: F,
        on_done: D,
    ) -> ChatResult<()>
    where
        F: FnMut(&str),
        D: FnOnce(),
    {
        let result = self.pump(messages, mode, on_fragment).await;
        on_done();
        result
    }

    /// Run the session on its own task and report through a channel.
    pub fn spawn_turn(&self, messages: Vec<ChatMessage>, mode: ChatMode) -> TurnEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            let result = client
                .pump(&messages, mode, |piece| {
                    let _ = tx.send(TurnEvent::Fragment(piece.to_string()));
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "chat stream failed");
                let _ = tx.send(TurnEvent::Failed(err));
            }
            let _ = tx.send(TurnEvent::Done);
        });
        rx
    }

    async fn pump<F>(&self, messages: &[ChatMessage], mode: ChatMode, mut on_fragment: F) -> ChatResult<()>
    where
        F: FnMut(&str),
    {
        let mut fragments = self.open(messages, mode).await?;
        let mut count = 0usize;
        while let Some(fragment) = fragments.next().await {
            on_fragment(&fragment?);
            count += 1;
        }
        tracing::debug!(fragments = count, "chat stream finished");
        Ok(())
    }
}
