//! Runtime configuration for the chat client.
//!
//! Values are looked up by key so the binary can layer `.env`, the process
//! environment and the bundled `assets/config.env` defaults.

use crate::ai::{ChatError, ChatResult};
use crate::types::ChatMode;
use std::collections::HashMap;

pub const PROXY_URL_KEY: &str = "CHAT_PROXY_URL";
pub const ACCESS_TOKEN_KEY: &str = "CHAT_ACCESS_TOKEN";
pub const MODE_KEY: &str = "CHAT_MODE";

#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    /// Base URL of the proxy; requests go to `{proxy_url}/chat`.
    pub proxy_url: String,
    pub access_token: Option<String>,
    pub default_mode: ChatMode,
}

impl ChatConfig {
    pub fn new(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            access_token: None,
            default_mode: ChatMode::default(),
        }
    }

    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let proxy_url = non_empty(PROXY_URL_KEY)
            .ok_or_else(|| ChatError::Config(format!("{PROXY_URL_KEY} is not set")))?;
        let default_mode = match non_empty(MODE_KEY) {
            Some(raw) => raw
                .parse::<ChatMode>()
                .map_err(|err| ChatError::Config(err.to_string()))?,
            None => ChatMode::default(),
        };

        Ok(Self {
            proxy_url,
            access_token: non_empty(ACCESS_TOKEN_KEY),
            default_mode,
        })
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}/chat", self.proxy_url.trim_end_matches('/'))
    }
}

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
