//! In-memory conversation history and participant lists.
//!
//! The [`ConversationStore`] keeps every conversation's records in creation
//! order. Records get a server id and a server timestamp on append; the
//! timestamp never goes backwards within a conversation, so a history
//! request with `since` never skips a record that was appended later.

use std::collections::{BTreeSet, HashMap};

use chatsync_proto::frame::ConversationSummary;
use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, MessageId, MessageRecord, Timestamp, UserId,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default maximum number of records returned by one history request.
const DEFAULT_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct Conversation {
    participants: BTreeSet<UserId>,
    records: Vec<MessageRecord>,
}

/// Thread-safe store of all conversations.
pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    history_limit: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Creates an empty store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Creates an empty store returning at most `history_limit` records per
    /// history request.
    #[must_use]
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Adds `user_id` to the participants of `conversation_id`, creating the
    /// conversation if needed.
    pub async fn join(&self, conversation_id: &ConversationId, user_id: &UserId) {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(conversation_id.clone())
            .or_default()
            .participants
            .insert(user_id.clone());
    }

    /// Appends a message, assigning its server id and timestamp.
    pub async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: MessageBody,
        client_id: Option<ClientMessageId>,
    ) -> MessageRecord {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.entry(conversation_id.clone()).or_default();
        conversation.participants.insert(sender_id.clone());

        let now = Timestamp::now();
        let created_at = conversation
            .records
            .last()
            .map_or(now, |last| last.created_at.max(now));
        let record = MessageRecord {
            id: MessageId::new(Uuid::new_v4().to_string()),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            body,
            created_at,
            client_id,
        };
        conversation.records.push(record.clone());
        record
    }

    /// Records of `conversation_id` created at or after `since`, oldest
    /// first, capped to the newest `history_limit`.
    pub async fn history(
        &self,
        conversation_id: &ConversationId,
        since: Option<Timestamp>,
    ) -> Vec<MessageRecord> {
        let conversations = self.conversations.read().await;
        let Some(conversation) = conversations.get(conversation_id) else {
            return Vec::new();
        };
        let start = since.map_or(0, |since| {
            conversation
                .records
                .partition_point(|r| r.created_at < since)
        });
        let matching = &conversation.records[start..];
        let skip = matching.len().saturating_sub(self.history_limit);
        matching[skip..].to_vec()
    }

    /// Conversations `user_id` takes part in, sorted by id.
    pub async fn list_for(&self, user_id: &UserId) -> Vec<ConversationSummary> {
        let conversations = self.conversations.read().await;
        let mut list: Vec<_> = conversations
            .iter()
            .filter(|(_, c)| c.participants.contains(user_id))
            .map(|(id, c)| ConversationSummary {
                id: id.clone(),
                participants: c.participants.iter().cloned().collect(),
                last_message_at: c.records.last().map(|r| r.created_at),
            })
            .collect();
        drop(conversations);
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Number of records stored for `conversation_id`.
    pub async fn len(&self, conversation_id: &ConversationId) -> usize {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map_or(0, |c| c.records.len())
    }
}
