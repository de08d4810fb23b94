//! Presence and typing state derived from backend events.
//!
//! The view is advisory: the most recent update per user wins, typing
//! indicators expire on their own, and everything is dropped when the
//! connection is re-established.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use chatsync_proto::message::{ConversationId, UserId};
use chatsync_proto::presence::PresenceUpdate;

/// Default lifetime of a typing indicator.
const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Presence of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Whether the user has a live session.
    pub online: bool,
    /// Conversation the user was last seen typing in.
    pub typing_in: Option<ConversationId>,
    /// When the last typing update arrived.
    pub last_typing: Option<Instant>,
}

/// Derives presence from [`PresenceUpdate`]s.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<UserId, PresenceEntry>,
    typing_timeout: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TIMEOUT)
    }
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            typing_timeout,
        }
    }

    /// Apply an update received at `now`. Returns whether anything changed.
    pub fn apply(&mut self, update: &PresenceUpdate, now: Instant) -> bool {
        let typing_in = update
            .typing_in_conversation_id
            .clone()
            .filter(|_| update.online);
        let next = PresenceEntry {
            online: update.online,
            last_typing: typing_in.as_ref().map(|_| now),
            typing_in,
        };
        let previous = self.entries.insert(update.user_id.clone(), next.clone());
        // A repeated typing update refreshes the timer but changes nothing visible.
        previous.is_none_or(|p| p.online != next.online || p.typing_in != next.typing_in)
    }

    /// Presence of `user_id`, if any update was seen since the last reset.
    #[must_use]
    pub fn lookup(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// Whether `user_id` is online. Unknown users are offline.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.entries.get(user_id).is_some_and(|e| e.online)
    }

    /// Online users, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.online)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Whether `user_id` typed in `conversation_id` within the timeout.
    #[must_use]
    pub fn is_typing(&self, user_id: &UserId, conversation_id: &ConversationId, now: Instant) -> bool {
        self.entries.get(user_id).is_some_and(|entry| {
            entry.typing_in.as_ref() == Some(conversation_id)
                && entry
                    .last_typing
                    .is_some_and(|at| now.duration_since(at) < self.typing_timeout)
        })
    }

    /// Users typing in `conversation_id`, sorted.
    #[must_use]
    pub fn typing_users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .entries
            .keys()
            .filter(|user| self.is_typing(user, conversation_id, now))
            .cloned()
            .collect();
        users.sort();
        users
    }

    /// Clear typing indicators older than the timeout. Returns affected users.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<UserId> {
        let timeout = self.typing_timeout;
        let mut expired = Vec::new();
        for (user, entry) in &mut self.entries {
            if entry
                .last_typing
                .is_some_and(|at| now.duration_since(at) >= timeout)
            {
                entry.typing_in = None;
                entry.last_typing = None;
                expired.push(user.clone());
            }
        }
        expired.sort();
        expired
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
