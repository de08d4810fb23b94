//! Merges history, optimistic sends and live events into the message store.
//!
//! The reconciler is a synchronous state machine: callers feed it inputs as
//! they arrive and it applies them to its [`MessageStore`] immediately.
//!
//! - An optimistic send is inserted as `pending` with a temporary id.
//! - A record authored by the local user is first checked against
//!   outstanding sends. A `clientId` echoed by the backend correlates
//!   exactly; otherwise the first pending send with identical content in
//!   the same conversation is the match (or the one closest in time, see
//!   [`EchoMatch`]). A matched entry takes the server id and becomes `sent`.
//! - A pending send that sees no echo within the timeout while connected
//!   becomes `failed`. A late echo still confirms it, until a resend of it
//!   is confirmed or it ages out of the bounded failed list.
//! - Anything else is inserted in timestamp order; a known server id is
//!   ignored.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, MessageRecord, Timestamp, UserId,
};

use super::store::{DeliveryState, Message, MessageKey, MessageStore};

/// Default time a send may stay pending while connected.
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Failed sends kept for late echoes and resends; older ones are dropped.
const MAX_FAILED: usize = 256;

/// Default maximum clock distance between a send and its echo.
const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(300);

/// Tie-break among pending sends with identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoMatch {
    /// The oldest matching send wins.
    #[default]
    Fifo,
    /// The send whose local timestamp is closest to the echo's wins.
    NearestTimestamp,
}

/// Tuning of echo matching and send timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Time a send may stay pending while connected before it fails.
    pub pending_timeout: Duration,
    /// Tie-break among identical pending sends.
    pub echo_match: EchoMatch,
    /// Content matches further apart than this are not echoes.
    pub echo_window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            echo_match: EchoMatch::default(),
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }
}

/// Result of merging one server record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// A new entry was inserted.
    Inserted,
    /// A local entry was confirmed by this record.
    Confirmed(ClientMessageId),
    /// The record was already present.
    Duplicate,
}

impl Merge {
    /// Whether the store changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// A send whose echo has not been seen.
#[derive(Debug, Clone)]
struct Outstanding {
    client_id: ClientMessageId,
    conversation_id: ConversationId,
    body: MessageBody,
    created_at: Timestamp,
    /// Only set while pending.
    deadline: Option<Instant>,
    /// The failed send this one resends.
    resends: Option<ClientMessageId>,
}

/// Applies sync inputs to a [`MessageStore`].
#[derive(Debug)]
pub struct Reconciler {
    local_user: UserId,
    config: ReconcileConfig,
    store: MessageStore,
    /// Pending sends in send order.
    pending: VecDeque<Outstanding>,
    /// Failed sends that a late echo may still confirm, oldest first.
    failed: Vec<Outstanding>,
}

impl Reconciler {
    /// Create a reconciler for sends authored by `local_user`.
    #[must_use]
    pub fn new(local_user: UserId, config: ReconcileConfig) -> Self {
        Self {
            local_user,
            config,
            store: MessageStore::new(),
            pending: VecDeque::new(),
            failed: Vec::new(),
        }
    }

    /// Read access to the merged messages.
    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    /// The user whose sends this reconciler tracks.
    #[must_use]
    pub const fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Number of sends awaiting their echo.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Insert an optimistic send and return its temporary id.
    ///
    /// `created_at` is the client's estimate of the creation time; the
    /// timeout is armed at `now`.
    pub fn begin_send(
        &mut self,
        conversation_id: ConversationId,
        body: MessageBody,
        created_at: Timestamp,
        now: Instant,
    ) -> ClientMessageId {
        self.record_send(conversation_id, body, created_at, now, None)
    }

    fn record_send(
        &mut self,
        conversation_id: ConversationId,
        body: MessageBody,
        created_at: Timestamp,
        now: Instant,
        resends: Option<ClientMessageId>,
    ) -> ClientMessageId {
        let client_id = ClientMessageId::generate();
        self.store.insert(Message {
            key: MessageKey::Local(client_id.clone()),
            conversation_id: conversation_id.clone(),
            sender_id: self.local_user.clone(),
            body: body.clone(),
            created_at,
            state: DeliveryState::Pending,
        });
        self.pending.push_back(Outstanding {
            client_id: client_id.clone(),
            conversation_id,
            body,
            created_at,
            deadline: Some(now + self.config.pending_timeout),
            resends,
        });
        tracing::debug!(client_id = %client_id, "optimistic send recorded");
        client_id
    }

    /// Mark a pending send as failed right away.
    ///
    /// Returns the conversation of the entry, or `None` if `client_id` is
    /// not pending.
    pub fn fail(&mut self, client_id: &ClientMessageId) -> Option<ConversationId> {
        let at = self.pending.iter().position(|p| &p.client_id == client_id)?;
        let mut entry = self.pending.remove(at)?;
        entry.deadline = None;
        self.store
            .set_state(&entry.conversation_id, client_id, DeliveryState::Failed);
        let conversation_id = entry.conversation_id.clone();
        tracing::info!(client_id = %client_id, conversation_id = %conversation_id, "send failed");
        if self.failed.len() >= MAX_FAILED {
            let dropped = self.failed.remove(0);
            tracing::debug!(client_id = %dropped.client_id, "oldest failed send no longer tracked");
        }
        self.failed.push(entry);
        Some(conversation_id)
    }

    /// Fail every pending send whose deadline has passed.
    ///
    /// Only call while connected; time spent disconnected does not count.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, ClientMessageId)> {
        let expired: Vec<ClientMessageId> = self
            .pending
            .iter()
            .filter(|p| p.deadline.is_some_and(|deadline| deadline <= now))
            .map(|p| p.client_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|client_id| {
                self.fail(&client_id)
                    .map(|conversation_id| (conversation_id, client_id))
            })
            .collect()
    }

    /// Restart the timeout of every pending send from `now`.
    pub fn rearm(&mut self, now: Instant) {
        let deadline = now + self.config.pending_timeout;
        for entry in &mut self.pending {
            entry.deadline = Some(deadline);
        }
    }

    /// Content of a failed send that may be resent.
    #[must_use]
    pub fn failed_send(&self, client_id: &ClientMessageId) -> Option<(&ConversationId, &MessageBody)> {
        self.failed
            .iter()
            .find(|f| &f.client_id == client_id)
            .map(|f| (&f.conversation_id, &f.body))
    }

    /// Re-enter a failed send as a new optimistic send.
    ///
    /// The failed entry stays in the store; once the resend is confirmed it
    /// can no longer be resent or promoted by a late echo. Returns the new
    /// temporary id, or `None` if `client_id` is not a failed send.
    pub fn resend(
        &mut self,
        client_id: &ClientMessageId,
        created_at: Timestamp,
        now: Instant,
    ) -> Option<(ConversationId, MessageBody, ClientMessageId)> {
        let (conversation_id, body) = self
            .failed_send(client_id)
            .map(|(c, b)| (c.clone(), b.clone()))?;
        let fresh = self.record_send(
            conversation_id.clone(),
            body.clone(),
            created_at,
            now,
            Some(client_id.clone()),
        );
        tracing::info!(failed = %client_id, client_id = %fresh, "resending");
        Some((conversation_id, body, fresh))
    }

    /// Merge one live record.
    pub fn ingest_live(&mut self, record: &MessageRecord) -> Merge {
        if self
            .store
            .contains_confirmed(&record.conversation_id, &record.id)
        {
            tracing::trace!(message_id = %record.id, "duplicate record ignored");
            return Merge::Duplicate;
        }

        if record.sender_id == self.local_user {
            if let Some(entry) = self.take_pending_match(record) {
                self.store.confirm(&entry.client_id, record);
                tracing::debug!(client_id = %entry.client_id, message_id = %record.id, "echo confirmed send");
                if let Some(original) = &entry.resends {
                    self.failed.retain(|f| &f.client_id != original);
                }
                return Merge::Confirmed(entry.client_id);
            }
            if let Some(entry) = self.take_failed_match(record) {
                self.store.confirm(&entry.client_id, record);
                tracing::info!(client_id = %entry.client_id, message_id = %record.id, "late echo confirmed failed send");
                return Merge::Confirmed(entry.client_id);
            }
        }

        self.store.insert(Message::confirmed(record));
        Merge::Inserted
    }

    /// Merge a history batch. Returns whether the store changed.
    pub fn ingest_history(&mut self, records: &[MessageRecord]) -> bool {
        let mut changed = false;
        for record in records {
            changed |= self.ingest_live(record).changed();
        }
        changed
    }

    fn take_pending_match(&mut self, record: &MessageRecord) -> Option<Outstanding> {
        let at = if let Some(client_id) = &record.client_id {
            self.pending.iter().position(|p| &p.client_id == client_id)?
        } else {
            let window = u64::try_from(self.config.echo_window.as_millis()).unwrap_or(u64::MAX);
            let candidates = self.pending.iter().enumerate().filter(|(_, p)| {
                p.conversation_id == record.conversation_id
                    && p.body == record.body
                    && p.created_at.abs_diff(record.created_at) <= window
            });
            match self.config.echo_match {
                EchoMatch::Fifo => candidates.map(|(at, _)| at).next()?,
                EchoMatch::NearestTimestamp => {
                    candidates
                        .min_by_key(|(_, p)| p.created_at.abs_diff(record.created_at))?
                        .0
                }
            }
        };
        self.pending.remove(at)
    }

    fn take_failed_match(&mut self, record: &MessageRecord) -> Option<Outstanding> {
        let at = if let Some(client_id) = &record.client_id {
            self.failed.iter().position(|f| &f.client_id == client_id)?
        } else {
            let window = u64::try_from(self.config.echo_window.as_millis()).unwrap_or(u64::MAX);
            self.failed.iter().position(|f| {
                f.conversation_id == record.conversation_id
                    && f.body == record.body
                    && f.created_at.abs_diff(record.created_at) <= window
            })?
        };
        Some(self.failed.remove(at))
    }
}
