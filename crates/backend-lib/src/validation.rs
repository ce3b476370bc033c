// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Message validation module.

use crate::config::LimitSettings;
use chat_relay_common::{MessageDraft, MessageKind, MessageScope};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Identities and channel ids come from external collaborators; keep them to a
// conservative character set so they are safe as file names and log fields.
static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@-]*$").expect("valid regex"));

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid channel ID: {0}")]
    InvalidChannelId(String),

    #[error("Text messages need non-empty content")]
    EmptyContent,

    #[error("Content is {len} bytes, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("File messages need an attachment reference")]
    MissingAttachment,

    #[error("Direct messages need two distinct identities")]
    SelfAddressed,
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

fn is_valid_id(value: &str, max_len: usize) -> bool {
    !value.is_empty() && value.len() <= max_len && ID_REGEX.is_match(value)
}

/// Validate an identity string supplied at connection time or as a receiver
pub fn validate_identity(identity: &str, limits: &LimitSettings) -> ValidationResult<()> {
    if is_valid_id(identity, limits.max_identity_len) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentity(identity.to_string()))
    }
}

/// Validate a channel id
pub fn validate_channel_id(channel_id: &str, limits: &LimitSettings) -> ValidationResult<()> {
    if is_valid_id(channel_id, limits.max_identity_len) {
        Ok(())
    } else {
        Err(ValidationError::InvalidChannelId(channel_id.to_string()))
    }
}

/// Validate a draft before it is handed to the persistence gateway
pub fn validate_draft(draft: &MessageDraft, limits: &LimitSettings) -> ValidationResult<()> {
    validate_identity(&draft.sender, limits)?;

    match &draft.scope {
        MessageScope::Direct { receiver } => {
            validate_identity(receiver, limits)?;
            if *receiver == draft.sender {
                return Err(ValidationError::SelfAddressed);
            }
        },
        MessageScope::Channel { channel_id } => validate_channel_id(channel_id, limits)?,
    }

    match draft.kind {
        MessageKind::Text => {
            let content = draft.content.as_deref().unwrap_or_default();
            if content.trim().is_empty() {
                return Err(ValidationError::EmptyContent);
            }
            if content.len() > limits.max_content_len {
                return Err(ValidationError::ContentTooLong {
                    len: content.len(),
                    max: limits.max_content_len,
                });
            }
        },
        MessageKind::File => {
            if draft
                .attachment
                .as_deref()
                .is_none_or(|a| a.trim().is_empty())
            {
                return Err(ValidationError::MissingAttachment);
            }
            if let Some(caption) = draft.content.as_deref() {
                if caption.len() > limits.max_content_len {
                    return Err(ValidationError::ContentTooLong {
                        len: caption.len(),
                        max: limits.max_content_len,
                    });
                }
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, receiver: &str, content: &str) -> MessageDraft {
        MessageDraft {
            sender: sender.to_string(),
            scope: MessageScope::Direct {
                receiver: receiver.to_string(),
            },
            kind: MessageKind::Text,
            content: Some(content.to_string()),
            attachment: None,
        }
    }

    #[test]
    fn test_identity_format() {
        let limits = LimitSettings::default();
        assert!(validate_identity("alice", &limits).is_ok());
        assert!(validate_identity("alice.smith@example.com", &limits).is_ok());
        assert!(validate_identity("", &limits).is_err());
        assert!(validate_identity("../etc/passwd", &limits).is_err());
        assert!(validate_identity("has space", &limits).is_err());
        assert!(validate_identity(&"a".repeat(limits.max_identity_len + 1), &limits).is_err());
    }

    #[test]
    fn test_direct_draft_rules() {
        let limits = LimitSettings::default();
        assert!(validate_draft(&text("alice", "bob", "hi"), &limits).is_ok());
        assert_eq!(
            validate_draft(&text("alice", "alice", "hi"), &limits),
            Err(ValidationError::SelfAddressed)
        );
        assert_eq!(
            validate_draft(&text("alice", "bob", "   "), &limits),
            Err(ValidationError::EmptyContent)
        );

        let long = "x".repeat(limits.max_content_len + 1);
        assert!(matches!(
            validate_draft(&text("alice", "bob", &long), &limits),
            Err(ValidationError::ContentTooLong { .. })
        ));
    }

    #[test]
    fn test_file_draft_needs_attachment() {
        let limits = LimitSettings::default();
        let mut draft = MessageDraft {
            sender: "alice".to_string(),
            scope: MessageScope::Channel {
                channel_id: "general".to_string(),
            },
            kind: MessageKind::File,
            content: None,
            attachment: None,
        };
        assert_eq!(
            validate_draft(&draft, &limits),
            Err(ValidationError::MissingAttachment)
        );

        draft.attachment = Some("uploads/report.pdf".to_string());
        assert!(validate_draft(&draft, &limits).is_ok());
    }
}
