//! In-process storage. Nothing survives a restart; meant for development
//! and tests.
use super::{check_draft_invariants, Channel, Storage};
use crate::error::AppError;
use async_trait::async_trait;
use chat_relay_common::{MessageDraft, MessageId, MessageScope, StoredMessage, UserProfile};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    messages: Vec<StoredMessage>,
    by_id: HashMap<MessageId, usize>,
    channels: HashMap<String, Channel>,
    profiles: HashMap<String, UserProfile>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a channel record (channel administration)
    pub async fn upsert_channel(&self, channel: &Channel) -> Result<(), AppError> {
        self.inner
            .write()
            .channels
            .insert(channel.id.clone(), channel.clone());
        Ok(())
    }

    /// Create or replace a profile record (profile administration)
    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), AppError> {
        self.inner
            .write()
            .profiles
            .insert(profile.identity.clone(), profile.clone());
        Ok(())
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_message(&self, draft: MessageDraft) -> Result<StoredMessage, AppError> {
        check_draft_invariants(&draft)?;

        let mut inner = self.inner.write();
        if let MessageScope::Channel { channel_id } = &draft.scope {
            if !inner.channels.contains_key(channel_id) {
                return Err(AppError::ChannelNotFound(channel_id.clone()));
            }
        }

        let message = StoredMessage::from_draft(Uuid::new_v4().to_string(), draft, Utc::now());
        let pos = inner.messages.len();
        inner.by_id.insert(message.id.clone(), pos);
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: &str) -> Result<StoredMessage, AppError> {
        let inner = self.inner.read();
        inner
            .by_id
            .get(id)
            .map(|&pos| inner.messages[pos].clone())
            .ok_or_else(|| AppError::MessageNotFound(id.to_string()))
    }

    async fn get_profile(&self, identity: &str) -> Result<Option<UserProfile>, AppError> {
        Ok(self.inner.read().profiles.get(identity).cloned())
    }

    async fn append_message_to_channel(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write();
        let channel = inner
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| AppError::ChannelNotFound(channel_id.to_string()))?;
        channel.messages.push(message_id.to_string());
        Ok(())
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, AppError> {
        self.inner
            .read()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| AppError::ChannelNotFound(channel_id.to_string()))
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, AppError> {
        Ok(self
            .inner
            .read()
            .messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_common::MessageKind;

    #[tokio::test]
    async fn test_self_addressed_direct_message_is_rejected() {
        let storage = MemoryStorage::new();
        let draft = MessageDraft {
            sender: "alice".to_string(),
            scope: MessageScope::Direct {
                receiver: "alice".to_string(),
            },
            kind: MessageKind::Text,
            content: Some("note to self".to_string()),
            attachment: None,
        };
        assert!(matches!(
            storage.create_message(draft).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(storage.message_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_message_id() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.get_message_with_profiles("missing").await,
            Err(AppError::MessageNotFound(_))
        ));
    }
}
