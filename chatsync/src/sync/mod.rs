//! Conversation synchronization engine.
//!
//! [`SyncClient`] ties the pieces together: a [`ConnectionManager`] feeds
//! connection events and server frames into a single engine task, which
//! drives the [`SubscriptionRouter`], the [`Reconciler`] and the
//! [`PresenceTracker`]. All sync state sits behind one lock and every
//! mutation happens synchronously inside it, so the UI can read a
//! consistent, ordered view at any time.
//!
//! UI-facing calls (`set_active_conversation`, `send`, ...) never block on
//! I/O: frames are queued on the connection and the outcome arrives later
//! as state changes, announced through [`SyncEvent`]s.

pub mod presence;
pub mod reconciler;
pub mod router;
pub mod store;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use chatsync_proto::frame::{ClientFrame, ConversationSummary, ServerFrame};
use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, SendRequest, Timestamp, UserId,
    ValidationError,
};

use crate::connection::{
    ConnectError, ConnectionEvent, ConnectionManager, DisconnectReason, Inbound,
    ReconnectPolicy, SessionStatus,
};
use crate::session::Identity;
use crate::transport::{Backend, TransportError};

use presence::{PresenceEntry, PresenceTracker};
use reconciler::{ReconcileConfig, Reconciler};
use router::{SubscriptionRouter, SubscriptionState};
use store::Message;

/// Default interval of the timeout sweep.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Default capacity of the [`SyncEvent`] channel.
const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default capacity of the connection channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default lifetime of a typing indicator.
const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Tuning of a [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Echo matching and send timeouts.
    pub reconcile: ReconcileConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Lifetime of a typing indicator.
    pub typing_timeout: Duration,
    /// How often send timeouts and typing indicators are checked.
    pub sweep_interval: Duration,
    /// Capacity of the [`SyncEvent`] channel.
    pub event_buffer: usize,
    /// Capacity of the connection feed and outbound queue (at least 2).
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileConfig::default(),
            reconnect: ReconnectPolicy::default(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Load state of a conversation's history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FetchState {
    /// Never requested.
    #[default]
    Idle,
    /// Requested, no answer yet.
    Loading,
    /// The latest request was answered.
    Loaded,
    /// The latest request failed; retried on the next activation.
    Failed(String),
}

/// Why an optimistic send failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// No echo arrived in time.
    Timeout,
    /// The send could not be queued on a live connection.
    NotConnected,
    /// The backend refused the send.
    Rejected(String),
}

/// Notifications for the UI layer.
///
/// Delivered best-effort: if the channel is full, events are dropped and the
/// UI catches up on its next read of the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Messages or load state of a conversation changed.
    MessagesChanged {
        /// The affected conversation.
        conversation_id: ConversationId,
    },
    /// The connection state changed.
    ConnectionChanged(ConnectionEvent),
    /// A user's presence changed.
    PresenceChanged {
        /// The affected user.
        user_id: UserId,
    },
    /// The conversation list was refreshed.
    ConversationsChanged,
    /// A history fetch failed.
    FetchFailed {
        /// The conversation whose history was requested.
        conversation_id: ConversationId,
        /// Human-readable reason.
        reason: String,
    },
    /// An optimistic send became `failed`.
    SendFailed {
        /// The conversation of the send.
        conversation_id: ConversationId,
        /// Temporary id of the failed entry.
        client_id: ClientMessageId,
        /// Why it failed.
        reason: SendFailure,
    },
    /// The backend refused the credentials; the session is over.
    AuthRejected {
        /// Human-readable reason.
        reason: String,
    },
    /// The backend reported an error not tied to a request.
    ServerError {
        /// Human-readable reason.
        reason: String,
    },
}

/// Errors returned by [`SyncClient::send`] and [`SyncClient::resend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The content is not sendable.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),
    /// No conversation is active.
    #[error("no active conversation")]
    NoActiveConversation,
    /// The given temporary id does not name a failed send.
    #[error("no failed message with that id")]
    UnknownMessage,
}

struct SyncState {
    reconciler: Reconciler,
    router: SubscriptionRouter,
    presence: PresenceTracker,
    fetch: HashMap<ConversationId, FetchState>,
    conversations: Vec<ConversationSummary>,
    /// Whether the engine has applied `Connected` more recently than
    /// `Disconnected`. Send timeouts only run while this is set.
    live: bool,
}

struct Shared<B: Backend> {
    state: Mutex<SyncState>,
    connection: ConnectionManager<B>,
    events: mpsc::Sender<SyncEvent>,
}

/// Handle to a running synchronization session.
///
/// Cheap to clone; all clones share one session. Created by
/// [`SyncClient::start`] and ended by [`SyncClient::shutdown`].
pub struct SyncClient<B: Backend> {
    shared: Arc<Shared<B>>,
    engine: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<B: Backend> Clone for SyncClient<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<B: Backend> SyncClient<B> {
    /// Connect `identity` to `backend` and start the sync engine.
    ///
    /// Returns the client and the receiving end of its event stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the initial connect fails.
    pub async fn start(
        backend: Arc<B>,
        identity: Identity,
        config: SyncConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>), ConnectError> {
        let connection =
            ConnectionManager::with_policy(backend, config.reconnect, config.channel_capacity);
        let mut feed = connection.connect(identity.clone()).await?;

        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncState {
                reconciler: Reconciler::new(identity.user_id.clone(), config.reconcile),
                router: SubscriptionRouter::new(),
                presence: PresenceTracker::new(config.typing_timeout),
                fetch: HashMap::new(),
                conversations: Vec::new(),
                live: false,
            }),
            connection,
            events,
        });

        // Apply the initial `Connected` before returning so that calls made
        // right after `start` already see a live session.
        while let Ok(item) = feed.try_recv() {
            shared.handle(item);
        }

        let engine = tokio::spawn(run_engine(
            Arc::clone(&shared),
            feed,
            config.sweep_interval,
        ));
        tracing::info!(user_id = %identity.user_id, "sync session started");

        Ok((
            Self {
                shared,
                engine: Arc::new(Mutex::new(Some(engine))),
            },
            events_rx,
        ))
    }

    /// Disconnect and stop the engine. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.connection.disconnect().await;
        let engine = self.engine.lock().take();
        if let Some(engine) = engine
            && let Err(e) = engine.await
        {
            tracing::warn!(err = %e, "sync engine ended abnormally");
        }
    }

    /// Make `next` the active conversation, or clear it with `None`.
    ///
    /// The previous conversation's subscription is closed first; once this
    /// returns none of its events are merged any more. Selecting the
    /// already active conversation does nothing.
    pub fn set_active_conversation(&self, next: Option<ConversationId>) {
        let mut state = self.shared.state.lock();
        if state.router.active() == next.as_ref() {
            return;
        }
        let frames = state.router.set_active(next.clone());
        if let Some(conversation_id) = next {
            state.fetch.insert(conversation_id, FetchState::Loading);
        }
        for frame in frames {
            self.shared.send_or_log(frame);
        }
    }

    /// The active conversation.
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.shared.state.lock().router.active().cloned()
    }

    /// State of the active subscription.
    pub fn subscription_state(&self) -> SubscriptionState {
        self.shared.state.lock().router.state()
    }

    /// Messages of `conversation_id` in display order.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.shared
            .state
            .lock()
            .reconciler
            .store()
            .messages(conversation_id)
    }

    /// Messages of the active conversation in display order.
    pub fn active_messages(&self) -> Vec<Message> {
        let state = self.shared.state.lock();
        state
            .router
            .active()
            .map(|id| state.reconciler.store().messages(id))
            .unwrap_or_default()
    }

    /// Load state of `conversation_id`.
    pub fn fetch_state(&self, conversation_id: &ConversationId) -> FetchState {
        self.shared
            .state
            .lock()
            .fetch
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the history of `conversation_id` is being loaded.
    pub fn is_loading(&self, conversation_id: &ConversationId) -> bool {
        self.fetch_state(conversation_id) == FetchState::Loading
    }

    /// Send a message to the active conversation.
    ///
    /// The message appears immediately as `pending` and its temporary id is
    /// returned. If there is no live connection it is marked `failed` at
    /// once and can be resent later.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Validation`] for empty or oversized content and
    /// [`SendError::NoActiveConversation`] if no conversation is active.
    pub fn send(&self, text: &str, image: Option<&str>) -> Result<ClientMessageId, SendError> {
        let body = MessageBody::new(Some(text.to_string()), image.map(str::to_string));
        body.validate()?;

        let mut state = self.shared.state.lock();
        let conversation_id = state
            .router
            .active()
            .cloned()
            .ok_or(SendError::NoActiveConversation)?;
        let client_id = state.reconciler.begin_send(
            conversation_id.clone(),
            body.clone(),
            Timestamp::now(),
            Instant::now(),
        );
        let events = self.shared.dispatch_send(&mut state, conversation_id, body, &client_id);
        drop(state);
        self.shared.emit_all(events);
        Ok(client_id)
    }

    /// Resend a failed message with a fresh temporary id.
    ///
    /// The failed entry stays visible; the new entry starts as `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::UnknownMessage`] if `client_id` is not a failed
    /// send, or if an earlier resend of it was already confirmed.
    pub fn resend(&self, client_id: &ClientMessageId) -> Result<ClientMessageId, SendError> {
        let mut state = self.shared.state.lock();
        let (conversation_id, body, fresh) = state
            .reconciler
            .resend(client_id, Timestamp::now(), Instant::now())
            .ok_or(SendError::UnknownMessage)?;
        let events = self.shared.dispatch_send(&mut state, conversation_id, body, &fresh);
        drop(state);
        self.shared.emit_all(events);
        Ok(fresh)
    }

    /// Presence of `user_id`.
    pub fn presence(&self, user_id: &UserId) -> Option<PresenceEntry> {
        self.shared.state.lock().presence.lookup(user_id).cloned()
    }

    /// Users currently online, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        self.shared.state.lock().presence.online_users()
    }

    /// Whether `user_id` is typing in `conversation_id`.
    pub fn is_typing(&self, user_id: &UserId, conversation_id: &ConversationId) -> bool {
        self.shared
            .state
            .lock()
            .presence
            .is_typing(user_id, conversation_id, Instant::now())
    }

    /// Users typing in `conversation_id`, sorted.
    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.shared
            .state
            .lock()
            .presence
            .typing_users(conversation_id, Instant::now())
    }

    /// Tell peers that the local user is typing in the active conversation.
    ///
    /// Returns whether the notification was queued.
    pub fn notify_typing(&self) -> bool {
        let state = self.shared.state.lock();
        let Some(conversation_id) = state.router.active().cloned() else {
            return false;
        };
        self.shared
            .connection
            .send_frame(ClientFrame::Typing { conversation_id })
            .is_ok()
    }

    /// The most recently received conversation list.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.shared.state.lock().conversations.clone()
    }

    /// Ask the backend for a fresh conversation list.
    pub fn refresh_conversations(&self) -> bool {
        self.shared
            .connection
            .send_frame(ClientFrame::ListConversations)
            .is_ok()
    }

    /// The local user.
    pub fn local_user(&self) -> UserId {
        self.shared.state.lock().reconciler.local_user().clone()
    }

    /// Current connection snapshot.
    pub fn connection_status(&self) -> SessionStatus {
        self.shared.connection.status()
    }

    /// Subscribe to connection snapshots.
    pub fn watch_connection(&self) -> watch::Receiver<SessionStatus> {
        self.shared.connection.watch_status()
    }
}

/// Engine task: applies the feed and runs periodic sweeps.
async fn run_engine<B: Backend>(
    shared: Arc<Shared<B>>,
    mut feed: mpsc::Receiver<Inbound>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_millis(10)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            item = feed.recv() => match item {
                Some(item) => shared.handle(item),
                None => break,
            },
            _ = sweep.tick() => shared.sweep(Instant::now()),
        }
    }
    tracing::debug!("sync engine stopped");
}

impl<B: Backend> Shared<B> {
    fn handle(&self, item: Inbound) {
        let mut state = self.state.lock();
        let events = match item {
            Inbound::Connection(event) => self.on_connection(&mut state, event),
            Inbound::Frame(frame) => self.on_frame(&mut state, frame),
        };
        drop(state);
        self.emit_all(events);
    }

    fn on_connection(&self, state: &mut SyncState, event: ConnectionEvent) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        match &event {
            ConnectionEvent::Connecting => {}
            ConnectionEvent::Connected => {
                state.live = true;
                state.presence.clear();
                state.reconciler.rearm(Instant::now());
                let frames = state.router.on_connected();
                if let Some(active) = state.router.active().cloned() {
                    tracing::info!(conversation_id = %active, "resuming subscription");
                    state.fetch.insert(active.clone(), FetchState::Loading);
                    events.push(SyncEvent::MessagesChanged {
                        conversation_id: active,
                    });
                }
                for frame in frames {
                    self.send_or_log(frame);
                }
                self.send_or_log(ClientFrame::ListConversations);
            }
            ConnectionEvent::Disconnected(reason) => {
                state.live = false;
                state.router.on_disconnected();
                state.presence.clear();
                if let DisconnectReason::AuthRejected(reason) = reason {
                    events.push(SyncEvent::AuthRejected {
                        reason: reason.clone(),
                    });
                }
            }
        }
        events.insert(0, SyncEvent::ConnectionChanged(event));
        events
    }

    fn on_frame(&self, state: &mut SyncState, frame: ServerFrame) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        match frame {
            ServerFrame::Message(record) => {
                if !state.router.accepts(&record.conversation_id) {
                    tracing::debug!(
                        conversation_id = %record.conversation_id,
                        message_id = %record.id,
                        "dropping event for inactive conversation"
                    );
                    return events;
                }
                let merge = state.reconciler.ingest_live(&record);
                state
                    .router
                    .advance_cursor(&record.conversation_id, record.created_at);
                if merge.changed() {
                    events.push(SyncEvent::MessagesChanged {
                        conversation_id: record.conversation_id,
                    });
                }
            }
            ServerFrame::History {
                conversation_id,
                messages,
            } => {
                if !state.router.accepts(&conversation_id) {
                    tracing::debug!(conversation_id = %conversation_id, "discarding stale history");
                    return events;
                }
                state.reconciler.ingest_history(&messages);
                let newest = messages.iter().map(|m| m.created_at).max();
                state.router.on_history(&conversation_id, newest);
                tracing::debug!(
                    conversation_id = %conversation_id,
                    count = messages.len(),
                    "history merged"
                );
                state.fetch.insert(conversation_id.clone(), FetchState::Loaded);
                events.push(SyncEvent::MessagesChanged { conversation_id });
            }
            ServerFrame::HistoryFailed {
                conversation_id,
                reason,
            } => {
                if !state.router.accepts(&conversation_id) {
                    return events;
                }
                tracing::warn!(conversation_id = %conversation_id, reason = %reason, "history fetch failed");
                state
                    .fetch
                    .insert(conversation_id.clone(), FetchState::Failed(reason.clone()));
                events.push(SyncEvent::FetchFailed {
                    conversation_id,
                    reason,
                });
            }
            ServerFrame::Subscribed { conversation_id } => {
                if !state.router.on_subscribed(&conversation_id) {
                    tracing::debug!(conversation_id = %conversation_id, "stale subscription ack");
                }
            }
            ServerFrame::Presence(update) => {
                if state.presence.apply(&update, Instant::now()) {
                    events.push(SyncEvent::PresenceChanged {
                        user_id: update.user_id,
                    });
                }
            }
            ServerFrame::Conversations { conversations } => {
                state.conversations = conversations;
                events.push(SyncEvent::ConversationsChanged);
            }
            ServerFrame::SendRejected { client_id, reason } => {
                tracing::warn!(reason = %reason, "send rejected by backend");
                if let Some(client_id) = client_id
                    && let Some(conversation_id) = state.reconciler.fail(&client_id)
                {
                    events.push(SyncEvent::MessagesChanged {
                        conversation_id: conversation_id.clone(),
                    });
                    events.push(SyncEvent::SendFailed {
                        conversation_id,
                        client_id,
                        reason: SendFailure::Rejected(reason),
                    });
                }
            }
            ServerFrame::Error { reason } => {
                tracing::warn!(reason = %reason, "backend error");
                events.push(SyncEvent::ServerError { reason });
            }
            ServerFrame::Welcome { .. } | ServerFrame::AuthRejected { .. } => {
                tracing::debug!("ignoring handshake frame on a live session");
            }
        }
        events
    }

    /// Fail overdue sends and expire typing indicators.
    fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        if state.live {
            let expired = state.reconciler.expire(now);
            let touched: BTreeSet<ConversationId> =
                expired.iter().map(|(c, _)| c.clone()).collect();
            for (conversation_id, client_id) in expired {
                tracing::info!(client_id = %client_id, "send timed out");
                events.push(SyncEvent::SendFailed {
                    conversation_id,
                    client_id,
                    reason: SendFailure::Timeout,
                });
            }
            events.extend(
                touched
                    .into_iter()
                    .map(|conversation_id| SyncEvent::MessagesChanged { conversation_id }),
            );
        }
        for user_id in state.presence.expire_typing(now) {
            events.push(SyncEvent::PresenceChanged { user_id });
        }
        drop(state);
        self.emit_all(events);
    }

    /// Queue the `Send` frame of a freshly inserted optimistic entry,
    /// failing the entry if there is no live connection.
    fn dispatch_send(
        &self,
        state: &mut SyncState,
        conversation_id: ConversationId,
        body: MessageBody,
        client_id: &ClientMessageId,
    ) -> Vec<SyncEvent> {
        let mut events = vec![SyncEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        }];
        let frame = ClientFrame::Send(SendRequest {
            conversation_id,
            body,
            client_id: Some(client_id.clone()),
        });
        if let Err(e) = self.connection.send_frame(frame) {
            tracing::info!(client_id = %client_id, err = %e, "send not queued");
            if let Some(conversation_id) = state.reconciler.fail(client_id) {
                events.push(SyncEvent::SendFailed {
                    conversation_id,
                    client_id: client_id.clone(),
                    reason: SendFailure::NotConnected,
                });
            }
        }
        events
    }

    fn send_or_log(&self, frame: ClientFrame) {
        match self.connection.send_frame(frame) {
            Ok(()) | Err(TransportError::NotConnected) => {}
            Err(e) => tracing::warn!(err = %e, "failed to queue frame"),
        }
    }

    fn emit_all(&self, events: Vec<SyncEvent>) {
        for event in events {
            if let Err(e) = self.events.try_send(event) {
                tracing::trace!(err = %e, "sync event dropped");
            }
        }
    }
}
