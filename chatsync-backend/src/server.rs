//! Backend server core: shared state, WebSocket handler, session registry,
//! and frame routing.
//!
//! Every connection starts with an `Authenticate` frame. Once accepted the
//! session may subscribe to conversations, fetch history, post messages and
//! signal typing. Posted messages get a server id and timestamp and are
//! pushed to every session subscribed to the conversation, plus the
//! sending session so the client sees its echo.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use chatsync_proto::codec;
use chatsync_proto::frame::{ClientFrame, ServerFrame};
use chatsync_proto::message::{ConversationId, SendRequest, UserId};
use chatsync_proto::presence::PresenceUpdate;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::store::ConversationStore;

/// Default maximum allowed size of an inbound frame in bytes (64 KB plus
/// envelope).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 96 * 1024;

type SessionId = u64;

struct Session {
    user_id: UserId,
    sender: mpsc::UnboundedSender<Message>,
    subscriptions: HashSet<ConversationId>,
}

/// Shared backend state holding live sessions and conversation history.
pub struct BackendState {
    sessions: RwLock<HashMap<SessionId, Session>>,
    next_session: AtomicU64,
    /// Conversation history and participants.
    pub store: ConversationStore,
    /// Accepted tokens per user. `None` accepts any non-empty token.
    tokens: Option<HashMap<String, String>>,
    max_payload_size: usize,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    /// Creates a backend accepting any non-empty token, with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE, ConversationStore::new(), None)
    }

    /// Creates a backend with custom limits and, optionally, a fixed token
    /// table.
    #[must_use]
    pub fn with_config(
        max_payload_size: usize,
        store: ConversationStore,
        tokens: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            store,
            tokens,
            max_payload_size,
        }
    }

    /// Whether `token` is a valid credential for `user_id`.
    #[must_use]
    pub fn authenticate(&self, user_id: &UserId, token: &str) -> bool {
        if user_id.as_str().is_empty() || token.is_empty() {
            return false;
        }
        self.tokens
            .as_ref()
            .is_none_or(|tokens| tokens.get(user_id.as_str()).is_some_and(|t| t == token))
    }

    /// Users with at least one live session, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        let sessions = self.sessions.read().await;
        let mut users: Vec<_> = sessions.values().map(|s| s.user_id.clone()).collect();
        drop(sessions);
        users.sort();
        users.dedup();
        users
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send a WebSocket Close frame to every session.
    ///
    /// Each session's writer forwards it, so clients observe a server-side
    /// disconnect. Used for graceful shutdown and reconnect tests.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            tracing::info!(session = id, user_id = %session.user_id, "sending close frame");
            let _ = session.sender.send(Message::Close(None));
        }
    }

    /// Registers a session. Returns its id and whether it is the user's
    /// first live session.
    async fn register(
        &self,
        user_id: &UserId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> (SessionId, bool) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().await;
        let first = !sessions.values().any(|s| &s.user_id == user_id);
        sessions.insert(
            id,
            Session {
                user_id: user_id.clone(),
                sender,
                subscriptions: HashSet::new(),
            },
        );
        (id, first)
    }

    /// Removes a session. Returns whether it was the user's last one.
    async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(removed) = sessions.remove(&id) else {
            return false;
        };
        !sessions.values().any(|s| s.user_id == removed.user_id)
    }

    async fn set_subscribed(&self, id: SessionId, conversation_id: &ConversationId, on: bool) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            if on {
                session.subscriptions.insert(conversation_id.clone());
            } else {
                session.subscriptions.remove(conversation_id);
            }
        }
    }

    async fn send_to(&self, id: SessionId, frame: &ServerFrame) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(&id) {
            deliver(session, frame);
        }
    }

    /// Push `frame` to every session subscribed to `conversation_id`, and
    /// to `also` even if it is not.
    async fn publish(&self, conversation_id: &ConversationId, also: SessionId, frame: &ServerFrame) {
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            if *id == also || session.subscriptions.contains(conversation_id) {
                deliver(session, frame);
            }
        }
    }

    /// Push a presence update to every session not owned by its user.
    async fn broadcast_presence(&self, update: PresenceUpdate) {
        let user_id = update.user_id.clone();
        let frame = ServerFrame::Presence(update);
        let sessions = self.sessions.read().await;
        for session in sessions.values().filter(|s| s.user_id != user_id) {
            deliver(session, &frame);
        }
    }
}

fn deliver(session: &Session, frame: &ServerFrame) {
    match codec::encode(frame) {
        Ok(text) => {
            if session.sender.send(Message::Text(text.into())).is_err() {
                tracing::debug!(user_id = %session.user_id, "session writer gone");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode frame"),
    }
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for an `Authenticate` frame; answer `Welcome` or `AuthRejected`.
/// 2. Register the session and send the current presence snapshot.
/// 3. Enter the frame loop.
/// 4. On disconnect, unregister and announce the user offline if this was
///    their last session.
pub async fn handle_socket(socket: WebSocket, state: Arc<BackendState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user_id) = wait_for_auth(&mut ws_receiver, &mut ws_sender, &state).await else {
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (session_id, first) = state.register(&user_id, tx).await;

    let welcome = ServerFrame::Welcome {
        user_id: user_id.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &welcome).await {
        tracing::error!(user_id = %user_id, error = %e, "failed to send Welcome");
        state.unregister(session_id).await;
        return;
    }
    tracing::info!(user_id = %user_id, session = session_id, "session authenticated");

    // Presence snapshot of everyone else, then announce this user.
    for other in state.online_users().await {
        if other != user_id {
            let snapshot = ServerFrame::Presence(PresenceUpdate {
                user_id: other,
                online: true,
                typing_in_conversation_id: None,
            });
            if send_frame(&mut ws_sender, &snapshot).await.is_err() {
                break;
            }
        }
    }
    if first {
        state
            .broadcast_presence(PresenceUpdate {
                user_id: user_id.clone(),
                online: true,
                typing_in_conversation_id: None,
            })
            .await;
    }

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(session_id, &reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                _ => {
                    // Binary, ping and pong frames carry nothing for us.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.unregister(session_id).await {
        state
            .broadcast_presence(PresenceUpdate {
                user_id: user_id.clone(),
                online: false,
                typing_in_conversation_id: None,
            })
            .await;
    }
    tracing::info!(user_id = %user_id, session = session_id, "session closed");
}

/// Waits for the `Authenticate` frame and checks the credential.
///
/// Returns the user on success. On rejection an `AuthRejected` frame is sent
/// before returning `None`.
async fn wait_for_auth(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &BackendState,
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let reason = match codec::decode::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Authenticate { user_id, token }) => {
                        if state.authenticate(&user_id, &token) {
                            return Some(user_id);
                        }
                        tracing::warn!(user_id = %user_id, "authentication rejected");
                        "invalid credentials".to_string()
                    }
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "expected Authenticate");
                        "authenticate first".to_string()
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode handshake frame");
                        format!("malformed frame: {e}")
                    }
                };
                let _ = send_frame(sender, &ServerFrame::AuthRejected { reason }).await;
                return None;
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles a text frame from an authenticated session.
async fn handle_text(session_id: SessionId, user_id: &UserId, text: &str, state: &Arc<BackendState>) {
    if text.len() > state.max_payload_size {
        tracing::warn!(
            user_id = %user_id,
            size = text.len(),
            max = state.max_payload_size,
            "frame exceeds size limit"
        );
        let err = ServerFrame::Error {
            reason: format!(
                "payload too large: {} bytes (max {})",
                text.len(),
                state.max_payload_size
            ),
        };
        state.send_to(session_id, &err).await;
        return;
    }

    let frame = match codec::decode::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "failed to decode frame");
            let err = ServerFrame::Error {
                reason: format!("malformed frame: {e}"),
            };
            state.send_to(session_id, &err).await;
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { conversation_id } => {
            state.store.join(&conversation_id, user_id).await;
            state.set_subscribed(session_id, &conversation_id, true).await;
            tracing::debug!(user_id = %user_id, conversation_id = %conversation_id, "subscribed");
            state
                .send_to(session_id, &ServerFrame::Subscribed { conversation_id })
                .await;
        }
        ClientFrame::Unsubscribe { conversation_id } => {
            state.set_subscribed(session_id, &conversation_id, false).await;
            tracing::debug!(user_id = %user_id, conversation_id = %conversation_id, "unsubscribed");
        }
        ClientFrame::FetchHistory {
            conversation_id,
            since,
        } => {
            let reply = if conversation_id.as_str().is_empty() {
                ServerFrame::HistoryFailed {
                    conversation_id,
                    reason: "empty conversation id".to_string(),
                }
            } else {
                let messages = state.store.history(&conversation_id, since).await;
                tracing::debug!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    count = messages.len(),
                    "serving history"
                );
                ServerFrame::History {
                    conversation_id,
                    messages,
                }
            };
            state.send_to(session_id, &reply).await;
        }
        ClientFrame::Send(request) => handle_send(session_id, user_id, request, state).await,
        ClientFrame::Typing { conversation_id } => {
            state
                .broadcast_presence(PresenceUpdate {
                    user_id: user_id.clone(),
                    online: true,
                    typing_in_conversation_id: Some(conversation_id),
                })
                .await;
        }
        ClientFrame::ListConversations => {
            let conversations = state.store.list_for(user_id).await;
            state
                .send_to(session_id, &ServerFrame::Conversations { conversations })
                .await;
        }
        ClientFrame::Authenticate { .. } => {
            tracing::warn!(user_id = %user_id, "duplicate Authenticate on a live session");
            let err = ServerFrame::Error {
                reason: "already authenticated".to_string(),
            };
            state.send_to(session_id, &err).await;
        }
    }
}

/// Validates and stores a message, then pushes it to subscribers.
async fn handle_send(
    session_id: SessionId,
    user_id: &UserId,
    request: SendRequest,
    state: &Arc<BackendState>,
) {
    let SendRequest {
        conversation_id,
        body,
        client_id,
    } = request;

    let rejection = if conversation_id.as_str().is_empty() {
        Some("empty conversation id".to_string())
    } else {
        body.validate().err().map(|e| e.to_string())
    };
    if let Some(reason) = rejection {
        tracing::warn!(user_id = %user_id, reason = %reason, "send rejected");
        state
            .send_to(session_id, &ServerFrame::SendRejected { client_id, reason })
            .await;
        return;
    }

    // The server-side sender is always the authenticated user.
    let record = state
        .store
        .append(&conversation_id, user_id, body, client_id)
        .await;
    tracing::debug!(
        user_id = %user_id,
        conversation_id = %conversation_id,
        message_id = %record.id,
        "message stored"
    );
    state
        .publish(&conversation_id, session_id, &ServerFrame::Message(record))
        .await;
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let text = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the backend on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BackendState::new())).await
}

/// Starts the backend with a pre-configured [`BackendState`].
///
/// Keep a clone of the `Arc` to inspect or drive the state from tests.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BackendState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "backend server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BackendState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
