//! Message records and identifiers for the `ChatSync` protocol.
//!
//! Identifiers are opaque strings assigned by the backend (messages,
//! conversations, users) or by the client ([`ClientMessageId`], used as the
//! temporary id of an optimistic send until the server echo arrives).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed text size of a message in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum allowed size of an image reference in bytes (4 MB).
///
/// Image references are URLs or inline data URIs.
pub const MAX_IMAGE_REF_SIZE: usize = 4 * 1024 * 1024;

/// Server-assigned message identifier, globally unique once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-assigned temporary identifier of an optimistic send.
///
/// Based on UUID v7 so that ids generated by one client sort by creation
/// time. Carried in [`SendRequest::client_id`] so a backend that echoes it
/// back allows exact correlation of the echo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientMessageId(String);

impl ClientMessageId {
    /// Creates a fresh temporary identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::now_v7()))
    }

    /// Wraps an existing temporary identifier (e.g. one typed by a user).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a conversation (direct thread or group).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// User-authored content of a message: optional text and optional image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageBody {
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Reference to a single attached image (URL or data URI).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text nor an image is present.
    #[error("message content is empty")]
    Empty,
    /// Text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Image reference exceeds the maximum allowed size.
    #[error("image reference too large ({size} bytes, max {max} bytes)")]
    ImageTooLarge {
        /// Actual size of the reference in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl MessageBody {
    /// Creates a text-only body.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Creates a body from optional parts, normalizing empty strings away.
    #[must_use]
    pub fn new(text: Option<String>, image: Option<String>) -> Self {
        Self {
            text: text.filter(|t| !t.is_empty()),
            image: image.filter(|i| !i.is_empty()),
        }
    }

    /// Validates this body for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if there is neither text nor image,
    /// [`ValidationError::TooLarge`] if the text exceeds [`MAX_MESSAGE_SIZE`],
    /// or [`ValidationError::ImageTooLarge`] if the image reference exceeds
    /// [`MAX_IMAGE_REF_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        let text_len = self.text.as_deref().map_or(0, str::len);
        let image_len = self.image.as_deref().map_or(0, str::len);
        if text_len == 0 && image_len == 0 {
            return Err(ValidationError::Empty);
        }
        if text_len > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size: text_len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if image_len > MAX_IMAGE_REF_SIZE {
            return Err(ValidationError::ImageTooLarge {
                size: image_len,
                max: MAX_IMAGE_REF_SIZE,
            });
        }
        Ok(())
    }
}

/// A server-confirmed message as delivered live or in a history batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text and image content.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Server-authoritative creation time.
    pub created_at: Timestamp,
    /// Temporary id of the originating send, if the backend echoes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// Outbound request to post a message to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Text and image content.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Temporary id of the optimistic entry this send created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}
