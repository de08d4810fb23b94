//! Ordered, deduplicated per-conversation message collection.
//!
//! The [`MessageStore`] is what a UI renders from. Each conversation keeps
//! its entries sorted by `(created_at, key)` and never holds two entries
//! with the same server-confirmed id. Every mutation is synchronous and
//! leaves the collection ordered and deduplicated.
//!
//! Only the reconciler mutates the store; everything else reads it.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, MessageId, MessageRecord, Timestamp, UserId,
};

/// Identifies a stored entry: the server id once confirmed, the client's
/// temporary id before.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Server-assigned id of a confirmed message.
    Confirmed(MessageId),
    /// Temporary id of an optimistic send awaiting its echo.
    Local(ClientMessageId),
}

impl MessageKey {
    /// The string form used as the ordering tie-break.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Confirmed(id) => id.as_str(),
            Self::Local(id) => id.as_str(),
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent locally, waiting for the server echo.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// No echo arrived in time; may be resent.
    Failed,
}

/// One entry of a conversation thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id or temporary id.
    pub key: MessageKey,
    /// Conversation the entry belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Text and image content.
    pub body: MessageBody,
    /// Server time once confirmed, client estimate before.
    pub created_at: Timestamp,
    /// Delivery state.
    pub state: DeliveryState,
}

impl Message {
    /// A confirmed entry built from a server record.
    #[must_use]
    pub fn confirmed(record: &MessageRecord) -> Self {
        Self {
            key: MessageKey::Confirmed(record.id.clone()),
            conversation_id: record.conversation_id.clone(),
            sender_id: record.sender_id.clone(),
            body: record.body.clone(),
            created_at: record.created_at,
            state: DeliveryState::Sent,
        }
    }

    /// Server id, if confirmed.
    #[must_use]
    pub const fn server_id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    /// Temporary id, if still local.
    #[must_use]
    pub const fn client_id(&self) -> Option<&ClientMessageId> {
        match &self.key {
            MessageKey::Local(id) => Some(id),
            MessageKey::Confirmed(_) => None,
        }
    }

    fn order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.key.as_str().cmp(other.key.as_str()))
    }
}

#[derive(Debug, Default)]
struct Thread {
    entries: Vec<Message>,
    confirmed: HashSet<MessageId>,
}

impl Thread {
    fn insert_sorted(&mut self, message: Message) {
        let at = self
            .entries
            .partition_point(|existing| existing.order(&message) == Ordering::Less);
        if let Some(id) = message.server_id() {
            self.confirmed.insert(id.clone());
        }
        self.entries.insert(at, message);
    }

    fn position_local(&self, client_id: &ClientMessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|m| m.client_id() == Some(client_id))
    }
}

/// Per-conversation ordered message collections.
#[derive(Debug, Default)]
pub struct MessageStore {
    threads: HashMap<ConversationId, Thread>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a conversation in display order.
    #[must_use]
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.threads
            .get(conversation_id)
            .map(|thread| thread.entries.clone())
            .unwrap_or_default()
    }

    /// Number of entries in a conversation.
    #[must_use]
    pub fn len(&self, conversation_id: &ConversationId) -> usize {
        self.threads
            .get(conversation_id)
            .map_or(0, |thread| thread.entries.len())
    }

    /// Whether a conversation has no entries.
    #[must_use]
    pub fn is_empty(&self, conversation_id: &ConversationId) -> bool {
        self.len(conversation_id) == 0
    }

    /// Whether a confirmed entry with `id` exists in the conversation.
    #[must_use]
    pub fn contains_confirmed(&self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|thread| thread.confirmed.contains(id))
    }

    /// The local entry with temporary id `client_id`, if any.
    #[must_use]
    pub fn find_local(
        &self,
        conversation_id: &ConversationId,
        client_id: &ClientMessageId,
    ) -> Option<&Message> {
        let thread = self.threads.get(conversation_id)?;
        thread
            .position_local(client_id)
            .map(|at| &thread.entries[at])
    }

    /// Creation time of the newest confirmed entry.
    #[must_use]
    pub fn newest_confirmed(&self, conversation_id: &ConversationId) -> Option<Timestamp> {
        self.threads.get(conversation_id).and_then(|thread| {
            thread
                .entries
                .iter()
                .rev()
                .find(|m| m.server_id().is_some())
                .map(|m| m.created_at)
        })
    }

    /// Conversations that hold at least one entry.
    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self
            .threads
            .iter()
            .filter(|(_, thread)| !thread.entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Insert an entry at its ordered position.
    ///
    /// Returns `false` and leaves the store unchanged if an entry with the
    /// same key already exists.
    pub(crate) fn insert(&mut self, message: Message) -> bool {
        let thread = self
            .threads
            .entry(message.conversation_id.clone())
            .or_default();
        let duplicate = match &message.key {
            MessageKey::Confirmed(id) => thread.confirmed.contains(id),
            MessageKey::Local(id) => thread.position_local(id).is_some(),
        };
        if duplicate {
            return false;
        }
        thread.insert_sorted(message);
        true
    }

    /// Replace the local entry `client_id` by the confirmed `record`.
    ///
    /// The entry takes the server id, timestamp and content and moves to
    /// its new ordered position with state [`DeliveryState::Sent`]. If a
    /// confirmed entry with the record's id already exists, the local entry
    /// is dropped in its favour. Returns `false` if no such local entry
    /// exists.
    pub(crate) fn confirm(&mut self, client_id: &ClientMessageId, record: &MessageRecord) -> bool {
        let Some(thread) = self.threads.get_mut(&record.conversation_id) else {
            return false;
        };
        let Some(at) = thread.position_local(client_id) else {
            return false;
        };
        thread.entries.remove(at);
        if !thread.confirmed.contains(&record.id) {
            thread.insert_sorted(Message::confirmed(record));
        }
        true
    }

    /// Change the state of the local entry `client_id`.
    pub(crate) fn set_state(
        &mut self,
        conversation_id: &ConversationId,
        client_id: &ClientMessageId,
        state: DeliveryState,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return false;
        };
        match thread.position_local(client_id) {
            Some(at) => {
                thread.entries[at].state = state;
                true
            }
            None => false,
        }
    }
}
