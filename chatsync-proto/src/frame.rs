//! Frames exchanged between `ChatSync` clients and the backend.
//!
//! Every frame is a JSON object carrying a `type` discriminator, e.g.
//! `{"type":"message","conversationId":"c1","id":"m1",...}`. The client
//! sends [`ClientFrame`]s and receives [`ServerFrame`]s.

use serde::{Deserialize, Serialize};

use crate::message::{
    ClientMessageId, ConversationId, MessageRecord, SendRequest, Timestamp, UserId,
};
use crate::presence::PresenceUpdate;

/// Frames sent from a client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame of every session; answered by `Welcome` or `AuthRejected`.
    Authenticate {
        /// The identity being claimed.
        user_id: UserId,
        /// Credential issued by the authentication collaborator.
        token: String,
    },
    /// Open the live message stream of one conversation.
    Subscribe {
        /// Conversation to subscribe to.
        conversation_id: ConversationId,
    },
    /// Close the live message stream of one conversation.
    Unsubscribe {
        /// Conversation to unsubscribe from.
        conversation_id: ConversationId,
    },
    /// Request the message history of a conversation.
    FetchHistory {
        /// Conversation whose history is requested.
        conversation_id: ConversationId,
        /// Only return records created at or after this instant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<Timestamp>,
    },
    /// Post a message.
    Send(SendRequest),
    /// The local user is typing in a conversation.
    Typing {
        /// Conversation being typed in.
        conversation_id: ConversationId,
    },
    /// Request the list of conversations visible to the user.
    ListConversations,
}

/// Summary of a conversation for list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Users taking part in the conversation.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// Creation time of the newest message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<Timestamp>,
}

/// Frames sent from the backend to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Authentication succeeded; the session is live.
    Welcome {
        /// The authenticated identity.
        user_id: UserId,
    },
    /// Authentication failed; the backend closes the session.
    AuthRejected {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// A live message event (new message or echo of the client's own send).
    Message(MessageRecord),
    /// A presence change of some user.
    Presence(PresenceUpdate),
    /// Response to `FetchHistory`: an ordered batch of records.
    History {
        /// Conversation the batch belongs to.
        conversation_id: ConversationId,
        /// Records, oldest first.
        messages: Vec<MessageRecord>,
    },
    /// `FetchHistory` could not be served.
    HistoryFailed {
        /// Conversation whose history was requested.
        conversation_id: ConversationId,
        /// Human-readable failure reason.
        reason: String,
    },
    /// Confirms that a live subscription is open.
    Subscribed {
        /// The subscribed conversation.
        conversation_id: ConversationId,
    },
    /// Response to `ListConversations`.
    Conversations {
        /// Conversations visible to the user.
        conversations: Vec<ConversationSummary>,
    },
    /// A `Send` was refused by the backend.
    SendRejected {
        /// Temporary id of the refused send, when the request carried one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientMessageId>,
        /// Human-readable rejection reason.
        reason: String,
    },
    /// Out-of-band error not tied to a specific request.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl ServerFrame {
    /// The conversation this frame is scoped to, if any.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Message(record) => Some(&record.conversation_id),
            Self::History {
                conversation_id, ..
            }
            | Self::HistoryFailed {
                conversation_id, ..
            }
            | Self::Subscribed { conversation_id } => Some(conversation_id),
            _ => None,
        }
    }
}
