//! Subscription routing for the active conversation.
//!
//! The router holds at most one [`Subscription`]. Changing the active
//! conversation returns the frames needed to tear the old subscription down
//! and open the new one, in order. Events are admitted only when their
//! conversation is the active one, so nothing from a previous conversation
//! leaks through once [`SubscriptionRouter::set_active`] has returned.

use chatsync_proto::frame::ClientFrame;
use chatsync_proto::message::{ConversationId, Timestamp};

/// Lifecycle of the active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No active conversation.
    Idle,
    /// Subscribe sent (or waiting for a connection), not yet confirmed.
    Subscribing,
    /// The backend confirmed the live stream.
    Subscribed,
}

/// The single live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Conversation being followed.
    pub conversation_id: ConversationId,
    /// Whether the backend confirmed the live stream.
    pub live: bool,
    /// Whether a history answer was merged since this conversation was
    /// activated. Until then the cursor stays unset.
    pub history_loaded: bool,
    /// Creation time of the newest merged message.
    pub cursor: Option<Timestamp>,
}

/// Maps the active conversation to exactly one subscription.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    active: Option<Subscription>,
    connected: bool,
}

impl SubscriptionRouter {
    /// Create an idle, disconnected router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of the state machine.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        match &self.active {
            None => SubscriptionState::Idle,
            Some(sub) if sub.live => SubscriptionState::Subscribed,
            Some(_) => SubscriptionState::Subscribing,
        }
    }

    /// The active conversation, if any.
    #[must_use]
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|sub| &sub.conversation_id)
    }

    /// The active subscription, if any.
    #[must_use]
    pub const fn subscription(&self) -> Option<&Subscription> {
        self.active.as_ref()
    }

    /// Whether events of `conversation_id` may be merged.
    #[must_use]
    pub fn accepts(&self, conversation_id: &ConversationId) -> bool {
        self.active() == Some(conversation_id)
    }

    /// Switch the active conversation.
    ///
    /// Returns the frames to send, in order: `Unsubscribe` for the previous
    /// conversation, then `Subscribe` and `FetchHistory` for the new one.
    /// Selecting the already active conversation returns nothing. While
    /// disconnected the switch happens locally and the frames are produced
    /// by [`on_connected`](Self::on_connected) later.
    pub fn set_active(&mut self, next: Option<ConversationId>) -> Vec<ClientFrame> {
        if self.active() == next.as_ref() {
            return Vec::new();
        }

        let mut frames = Vec::new();
        if let Some(previous) = self.active.take() {
            tracing::debug!(conversation_id = %previous.conversation_id, "closing subscription");
            if self.connected {
                frames.push(ClientFrame::Unsubscribe {
                    conversation_id: previous.conversation_id,
                });
            }
        }

        if let Some(conversation_id) = next {
            tracing::debug!(conversation_id = %conversation_id, "opening subscription");
            self.active = Some(Subscription {
                conversation_id,
                live: false,
                history_loaded: false,
                cursor: None,
            });
            if self.connected {
                frames.extend(self.open_frames());
            }
        }
        frames
    }

    /// A link became live: replay the active subscription.
    ///
    /// History is fetched from the cursor so that anything missed while
    /// disconnected is merged.
    pub fn on_connected(&mut self) -> Vec<ClientFrame> {
        self.connected = true;
        if let Some(sub) = &mut self.active {
            sub.live = false;
        }
        self.open_frames()
    }

    /// The link is gone; the subscription must be replayed on reconnect.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        if let Some(sub) = &mut self.active {
            sub.live = false;
        }
    }

    /// The backend confirmed a subscription. Stale confirmations are ignored.
    pub fn on_subscribed(&mut self, conversation_id: &ConversationId) -> bool {
        match &mut self.active {
            Some(sub) if &sub.conversation_id == conversation_id => {
                sub.live = true;
                true
            }
            _ => false,
        }
    }

    /// Record that a live message created at `created_at` was merged.
    ///
    /// Ignored until the first history answer of the activation arrived, so
    /// a reconnect before that still fetches the full history.
    pub fn advance_cursor(&mut self, conversation_id: &ConversationId, created_at: Timestamp) {
        if let Some(sub) = &mut self.active
            && &sub.conversation_id == conversation_id
            && sub.history_loaded
            && sub.cursor.is_none_or(|cursor| cursor < created_at)
        {
            sub.cursor = Some(created_at);
        }
    }

    /// A history answer for the active conversation was merged; `newest` is
    /// the creation time of its newest record.
    pub fn on_history(&mut self, conversation_id: &ConversationId, newest: Option<Timestamp>) {
        let Some(sub) = &mut self.active else {
            return;
        };
        if &sub.conversation_id != conversation_id {
            return;
        }
        sub.history_loaded = true;
        if let Some(newest) = newest {
            self.advance_cursor(conversation_id, newest);
        }
    }

    fn open_frames(&self) -> Vec<ClientFrame> {
        let Some(sub) = &self.active else {
            return Vec::new();
        };
        vec![
            ClientFrame::Subscribe {
                conversation_id: sub.conversation_id.clone(),
            },
            ClientFrame::FetchHistory {
                conversation_id: sub.conversation_id.clone(),
                since: sub.cursor,
            },
        ]
    }
}
