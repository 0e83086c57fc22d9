//! Completion relay client
//!
//! Sends the ordered conversation history and receives one reply string.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::store::{Role, StoredMessage};
use crate::{Error, Result};

/// Produces the assistant's reply for a conversation
#[async_trait]
pub trait CompletionRelay: Send + Sync {
    /// Reply to `history`, oldest message first
    ///
    /// # Errors
    ///
    /// Returns `Relay` if no reply could be produced
    async fn reply(&self, history: &[StoredMessage]) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    messages: Vec<RelayMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    reply: Option<String>,
    error: Option<String>,
}

/// Relay over HTTP: `POST { messages }` returns `{ reply }`
#[derive(Debug, Clone)]
pub struct HttpCompletionRelay {
    client: reqwest::Client,
    url: String,
}

impl HttpCompletionRelay {
    /// Create a relay client for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CompletionRelay for HttpCompletionRelay {
    async fn reply(&self, history: &[StoredMessage]) -> Result<String> {
        let request = RelayRequest {
            messages: history
                .iter()
                .map(|m| RelayMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
        };

        tracing::debug!(messages = request.messages.len(), url = %self.url, "requesting reply");

        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: Option<RelayResponse> = serde_json::from_str(&body).ok();
        match parsed {
            Some(RelayResponse {
                reply: Some(reply), ..
            }) if status.is_success() => {
                tracing::debug!(chars = reply.chars().count(), "reply received");
                Ok(reply)
            }
            Some(RelayResponse {
                error: Some(error), ..
            }) => {
                tracing::error!(status = %status, error = %error, "relay returned an error");
                Err(Error::Relay(error))
            }
            _ => {
                tracing::error!(status = %status, body = %body, "unexpected relay response");
                Err(Error::Relay(format!("unexpected response ({status})")))
            }
        }
    }
}
