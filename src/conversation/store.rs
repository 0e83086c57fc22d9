//! Conversation message log

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only ordered log of role-tagged text
pub trait MessageStore: Send + Sync {
    /// All messages, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn list(&self) -> Result<Vec<StoredMessage>>;

    /// Append one message
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn append(&self, role: Role, content: &str) -> Result<StoredMessage>;

    /// Remove every message
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn clear(&self) -> Result<()>;
}

/// Process-local message store
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn list(&self) -> Result<Vec<StoredMessage>> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .map_err(|_| Error::Store("message log poisoned".to_string()))
    }

    fn append(&self, role: Role, content: &str) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let mut messages = self
            .messages
            .lock()
            .map_err(|_| Error::Store("message log poisoned".to_string()))?;
        messages.push(message.clone());
        tracing::trace!(role = role.as_str(), count = messages.len(), "message stored");
        drop(messages);

        Ok(message)
    }

    fn clear(&self) -> Result<()> {
        self.messages
            .lock()
            .map(|mut messages| messages.clear())
            .map_err(|_| Error::Store("message log poisoned".to_string()))
    }
}
