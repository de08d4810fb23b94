//! Presence updates for online/offline and typing status.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, UserId};

/// A presence change pushed by the backend.
///
/// Presence is advisory: clients keep only the most recent update per user
/// and rebuild their view from scratch after every reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// The user whose presence changed.
    pub user_id: UserId,
    /// Whether the user currently has a live session.
    pub online: bool,
    /// Conversation the user is typing in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_in_conversation_id: Option<ConversationId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_field_is_optional_on_the_wire() {
        let update: PresenceUpdate =
            serde_json::from_str(r#"{"userId":"bob","online":true}"#).unwrap();
        assert_eq!(update.user_id, UserId::new("bob"));
        assert!(update.online);
        assert_eq!(update.typing_in_conversation_id, None);
    }

    #[test]
    fn typing_field_serializes_camel_case() {
        let update = PresenceUpdate {
            user_id: UserId::new("bob"),
            online: true,
            typing_in_conversation_id: Some(ConversationId::new("c1")),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""typingInConversationId":"c1""#));
    }
}
