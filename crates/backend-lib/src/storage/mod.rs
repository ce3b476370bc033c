// ============================
// crates/backend-lib/src/storage/mod.rs
// ============================
//! Persistence gateway.
//!
//! Messages, channels and profiles live behind the [`Storage`] trait. The
//! relay itself only ever appends messages and appends message ids to a
//! channel; channel membership and profiles are written by the external
//! administration services (see `upsert_channel` / `upsert_profile` on each
//! backend).
mod flat_file;
mod memory;

pub use flat_file::FlatFileStorage;
pub use memory::MemoryStorage;

use crate::error::AppError;
use async_trait::async_trait;
use chat_relay_common::{
    ChannelId, MessageDraft, MessageId, MessageScope, PopulatedMessage, StoredMessage, UserId,
    UserProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A channel record as kept by the channel administration service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
    #[serde(default)]
    pub admins: BTreeSet<UserId>,
    /// Message ids in the order they were appended
    #[serde(default)]
    pub messages: Vec<MessageId>,
}

impl Channel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members: BTreeSet::new(),
            admins: BTreeSet::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_members<I, T>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<UserId>,
    {
        self.members.extend(members.into_iter().map(Into::into));
        self
    }

    pub fn with_admins<I, T>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<UserId>,
    {
        self.admins.extend(admins.into_iter().map(Into::into));
        self
    }

    /// True if `identity` is a member or an admin
    pub fn is_participant(&self, identity: &str) -> bool {
        self.members.contains(identity) || self.admins.contains(identity)
    }
}

/// Recipient sets of a channel, as read by the delivery engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMembers {
    pub channel_id: ChannelId,
    pub members: Vec<UserId>,
    pub admins: Vec<UserId>,
}

impl From<&Channel> for ChannelMembers {
    fn from(channel: &Channel) -> Self {
        Self {
            channel_id: channel.id.clone(),
            members: channel.members.iter().cloned().collect(),
            admins: channel.admins.iter().cloned().collect(),
        }
    }
}

/// Trait for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new message and return the stored record.
    ///
    /// Channel-scoped drafts must name an existing channel; direct drafts
    /// must name two distinct identities. Once this returns `Ok` the message
    /// is durable and visible to history reads.
    async fn store_message(&self, draft: MessageDraft) -> Result<StoredMessage, AppError>;

    /// Read a stored message by id
    async fn get_message(&self, id: &str) -> Result<StoredMessage, AppError>;

    /// Profile for `identity`, if the profile service has one
    async fn get_profile(&self, identity: &str) -> Result<Option<UserProfile>, AppError>;

    /// Append a message id to a channel's history
    async fn append_message_to_channel(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), AppError>;

    /// Read a channel record
    async fn get_channel(&self, channel_id: &str) -> Result<Channel, AppError>;

    /// Direct messages exchanged between `a` and `b`, oldest first
    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, AppError>;

    /// Persist a new message and return its assigned id
    async fn create_message(&self, draft: MessageDraft) -> Result<MessageId, AppError> {
        Ok(self.store_message(draft).await?.id)
    }

    /// Profile for `identity`, or a placeholder when there is no record
    async fn profile_or_placeholder(&self, identity: &str) -> Result<UserProfile, AppError> {
        Ok(self
            .get_profile(identity)
            .await?
            .unwrap_or_else(|| UserProfile::placeholder(identity)))
    }

    /// Read a stored message with sender and receiver profiles filled in
    async fn get_message_with_profiles(&self, id: &str) -> Result<PopulatedMessage, AppError> {
        let message = self.get_message(id).await?;
        self.populate(message).await
    }

    /// Read a channel's member and admin sets
    async fn get_channel_with_members(&self, channel_id: &str) -> Result<ChannelMembers, AppError> {
        let channel = self.get_channel(channel_id).await?;
        Ok(ChannelMembers::from(&channel))
    }

    /// Populated history of the `a`/`b` conversation, oldest first
    async fn conversation_history(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Vec<PopulatedMessage>, AppError> {
        let mut out = Vec::new();
        for message in self.conversation(a, b).await? {
            out.push(self.populate(message).await?);
        }
        Ok(out)
    }

    /// Populated history of a channel, in append order
    async fn channel_history(&self, channel_id: &str) -> Result<Vec<PopulatedMessage>, AppError> {
        let channel = self.get_channel(channel_id).await?;
        let mut out = Vec::with_capacity(channel.messages.len());
        for id in &channel.messages {
            out.push(self.get_message_with_profiles(id).await?);
        }
        Ok(out)
    }

    /// Fill in profile fields for client rendering
    async fn populate(&self, message: StoredMessage) -> Result<PopulatedMessage, AppError> {
        let sender = self.profile_or_placeholder(&message.sender).await?;
        let receiver = match message.scope.receiver() {
            Some(receiver) => Some(self.profile_or_placeholder(receiver).await?),
            None => None,
        };
        Ok(PopulatedMessage::from_stored(message, sender, receiver))
    }
}

/// Checks shared by every backend before a draft is accepted
fn check_draft_invariants(draft: &MessageDraft) -> Result<(), AppError> {
    if let MessageScope::Direct { receiver } = &draft.scope {
        if *receiver == draft.sender {
            return Err(crate::validation::ValidationError::SelfAddressed.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_members_are_sorted_sets() {
        let channel = Channel::new("general", "General")
            .with_members(["carol", "alice", "alice"])
            .with_admins(["bob"]);
        let members = ChannelMembers::from(&channel);
        assert_eq!(members.members, vec!["alice", "carol"]);
        assert_eq!(members.admins, vec!["bob"]);
        assert!(channel.is_participant("bob"));
        assert!(!channel.is_participant("dave"));
    }
}
