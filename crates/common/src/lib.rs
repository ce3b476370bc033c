// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between chat clients and the relay server.
//! This module defines the WebSocket protocol events and the message records
//! they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user key supplied by the external auth collaborator
pub type UserId = String;

/// Channel identifier
pub type ChannelId = String;

/// Message identifier assigned by the persistence layer
pub type MessageId = String;

/// Whether a message carries inline text or an attachment reference
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

/// Who a message is addressed to
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum MessageScope {
    /// A single other identity
    Direct { receiver: UserId },
    /// Every member and admin of a channel
    Channel { channel_id: ChannelId },
}

impl MessageScope {
    /// Channel id, if this is a channel-scoped message
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            MessageScope::Channel { channel_id } => Some(channel_id),
            MessageScope::Direct { .. } => None,
        }
    }

    /// Receiver, if this is a direct message
    pub fn receiver(&self) -> Option<&str> {
        match self {
            MessageScope::Direct { receiver } => Some(receiver),
            MessageScope::Channel { .. } => None,
        }
    }
}

/// A message before it has been persisted
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender: UserId,
    #[serde(flatten)]
    pub scope: MessageScope,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    /// Reference handed out by the external file-upload collaborator
    #[serde(default)]
    pub attachment: Option<String>,
}

/// A persisted, immutable message record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: UserId,
    #[serde(flatten)]
    pub scope: MessageScope,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Stamp a draft with its assigned id and creation time
    pub fn from_draft(id: MessageId, draft: MessageDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            sender: draft.sender,
            scope: draft.scope,
            kind: draft.kind,
            content: draft.content,
            attachment: draft.attachment,
            created_at,
        }
    }

    /// True if this is a direct message exchanged between `a` and `b`,
    /// in either direction
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        match &self.scope {
            MessageScope::Direct { receiver } => {
                (self.sender == a && receiver == b) || (self.sender == b && receiver == a)
            },
            MessageScope::Channel { .. } => false,
        }
    }
}

/// Display fields for an identity, owned by the external profile service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub identity: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Profile used when the profile service has no record for an identity
    pub fn placeholder(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            display_name: identity.to_string(),
            avatar_url: None,
        }
    }
}

/// A stored message with profile fields filled in for client rendering
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PopulatedMessage {
    pub id: MessageId,
    pub sender: UserProfile,
    /// Set for direct messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserProfile>,
    /// Set for channel messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PopulatedMessage {
    /// Attach already resolved profiles to a stored message. `receiver` is
    /// only kept for direct messages.
    pub fn from_stored(
        message: StoredMessage,
        sender: UserProfile,
        receiver: Option<UserProfile>,
    ) -> Self {
        let (receiver, channel_id) = match message.scope {
            MessageScope::Direct { .. } => (receiver, None),
            MessageScope::Channel { channel_id } => (None, Some(channel_id)),
        };
        Self {
            id: message.id,
            sender,
            receiver,
            channel_id,
            kind: message.kind,
            content: message.content,
            attachment: message.attachment,
            created_at: message.created_at,
        }
    }
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType", rename_all = "camelCase")]
pub enum ClientToServer {
    /// Identify a connection that was opened without an identity
    Identify { identity: UserId },
    /// Send a direct message
    /// # Fields
    /// * `receiver` - Identity of the other participant
    /// * `kind` - `text` or `file`
    /// * `content` - Text body, required for `text`
    /// * `attachment` - Upload reference, required for `file`
    SendMessage {
        receiver: UserId,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        attachment: Option<String>,
    },
    /// Send a message to every member and admin of a channel
    SendMessageOnChannel {
        channel_id: ChannelId,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        attachment: Option<String>,
    },
    /// Request the direct-message history with `peer`
    FetchConversation { peer: UserId },
    /// Request a channel's message history
    FetchChannelHistory { channel_id: ChannelId },
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType", rename_all = "camelCase")]
pub enum ServerToClient {
    /// The connection is now bound to `identity`
    Identified { identity: UserId },
    /// A direct message, pushed to both sender and receiver
    ReceiveMessage { message: PopulatedMessage },
    /// A channel message; `message.channel_id` is always set
    ReceiveChannelMessage { message: PopulatedMessage },
    /// Response to `fetchConversation`
    ConversationHistory {
        peer: UserId,
        messages: Vec<PopulatedMessage>,
    },
    /// Response to `fetchChannelHistory`
    ChannelHistory {
        channel_id: ChannelId,
        messages: Vec<PopulatedMessage>,
    },
    /// The submitted message was not stored and was not delivered
    SendFailed { code: String, message: String },
    /// Error response for frames that could not be decoded
    MalformedMessage { err_msg: String },
    /// Any other request error
    Error { code: String, message: String },
}
