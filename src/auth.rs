use crate::ai::ChatResult;
use async_trait::async_trait;

/// Source of the bearer token sent with every proxy request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current session token, if the user has one.
    async fn access_token(&self) -> ChatResult<Option<String>>;
}

/// Token fixed at startup, e.g. from `CHAT_ACCESS_TOKEN`.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> ChatResult<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// No session; requests go out without an `Authorization` header.
#[derive(Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl TokenProvider for Anonymous {
    async fn access_token(&self) -> ChatResult<Option<String>> {
        Ok(None)
    }
}
