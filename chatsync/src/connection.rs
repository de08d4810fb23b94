//! Connection management: one live backend session per identity.
//!
//! [`ConnectionManager`] owns the [`Link`] to the backend. After a successful
//! [`connect`](ConnectionManager::connect) a supervisor task pumps frames in
//! both directions and, when the link drops unexpectedly, reconnects with
//! exponential backoff until [`disconnect`](ConnectionManager::disconnect) is
//! called or the backend rejects the credentials.
//!
//! Everything the session produces (state changes and server frames) arrives
//! on a single ordered feed of [`Inbound`] items, so a consumer sees
//! `Connected` strictly before any frame of the new link.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chatsync_proto::frame::{ClientFrame, ServerFrame};

use crate::session::Identity;
use crate::transport::{Backend, Link, TransportError};

/// Default initial reconnect delay.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default multiplier applied to the delay after every failed attempt.
const DEFAULT_FACTOR: u32 = 2;

/// Default upper bound of the reconnect delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default capacity of the inbound feed and the outbound queue.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Smallest feed that holds the `Connecting`/`Connected` pair queued by
/// [`ConnectionManager::connect`] before anyone reads it.
pub const MIN_CHANNEL_CAPACITY: usize = 2;

/// Lifecycle state of the connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session, and none being established.
    #[default]
    Disconnected,
    /// A connect or reconnect attempt is in flight.
    Connecting,
    /// The session is live.
    Connected,
}

/// Snapshot of the connection session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempts since the link was last live.
    pub retry_count: u32,
    /// Most recent connection error, cleared on success.
    pub last_error: Option<String>,
}

/// Why a session stopped being connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ConnectionManager::disconnect`] was called.
    Requested,
    /// The link failed or a reconnect attempt could not reach the backend.
    TransportLost(String),
    /// The backend refused the credentials; no further attempts are made.
    AuthRejected(String),
}

/// Connection state transitions, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt started.
    Connecting,
    /// A link is live. Consumers treat this as a resume point.
    Connected,
    /// The link is gone.
    Disconnected(DisconnectReason),
}

/// One item of the session feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A connection state transition.
    Connection(ConnectionEvent),
    /// A frame received from the backend.
    Frame(ServerFrame),
}

/// Errors returned by [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The backend refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// The backend could not be reached.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthRejected(reason) => Self::AuthRejected(reason),
            other => Self::TransportUnavailable(other.to_string()),
        }
    }
}

/// Exponential backoff schedule for reconnect attempts.
///
/// Retries are unbounded; only the delay is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Multiplier applied after every failed attempt.
    pub factor: u32,
    /// Upper bound of the delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(attempt);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

struct ActiveSession {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the backend session for one identity.
pub struct ConnectionManager<B: Backend> {
    backend: Arc<B>,
    policy: ReconnectPolicy,
    channel_capacity: usize,
    status: Arc<watch::Sender<SessionStatus>>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<ClientFrame>>>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl<B: Backend> ConnectionManager<B> {
    /// Create a manager with the default policy and channel capacity.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_policy(backend, ReconnectPolicy::default(), DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a manager with an explicit reconnect policy and channel capacity.
    ///
    /// Capacities below [`MIN_CHANNEL_CAPACITY`] are raised to it.
    pub fn with_policy(backend: Arc<B>, policy: ReconnectPolicy, channel_capacity: usize) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            backend,
            policy,
            channel_capacity: channel_capacity.max(MIN_CHANNEL_CAPACITY),
            status: Arc::new(status),
            outbound: parking_lot::Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Establish a session for `identity` and return its event feed.
    ///
    /// Any existing session is torn down first. On success the feed already
    /// holds `Connecting` and `Connected`; it then carries server frames and
    /// later state transitions until the session is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::AuthRejected`] if the backend refuses the
    /// credentials, or [`ConnectError::TransportUnavailable`] if it cannot
    /// be reached. The initial connect is not retried.
    pub async fn connect(&self, identity: Identity) -> Result<mpsc::Receiver<Inbound>, ConnectError> {
        self.disconnect().await;

        let (feed_tx, feed_rx) = mpsc::channel(self.channel_capacity);
        set_state(&self.status, ConnectionState::Connecting, None);
        let _ = feed_tx.try_send(Inbound::Connection(ConnectionEvent::Connecting));

        let link = match self.backend.connect(&identity).await {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(user_id = %identity.user_id, err = %err, "connect failed");
                set_state(&self.status, ConnectionState::Disconnected, Some(err.to_string()));
                return Err(err.into());
            }
        };

        set_state(&self.status, ConnectionState::Connected, None);
        let _ = feed_tx.try_send(Inbound::Connection(ConnectionEvent::Connected));
        tracing::info!(user_id = %identity.user_id, "session connected");

        let (out_tx, out_rx) = mpsc::channel(self.channel_capacity);
        *self.outbound.lock() = Some(out_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            backend: Arc::clone(&self.backend),
            identity,
            policy: self.policy,
            status: Arc::clone(&self.status),
            outbound: out_rx,
            feed: feed_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run(link));

        *self.session.lock().await = Some(ActiveSession {
            shutdown: shutdown_tx,
            task,
        });
        Ok(feed_rx)
    }

    /// Tear down the session. Idempotent.
    ///
    /// Cancels any pending reconnect timer and waits for the supervisor to
    /// close the link.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        self.outbound.lock().take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            if let Err(e) = session.task.await {
                tracing::warn!(err = %e, "connection supervisor ended abnormally");
            }
            tracing::info!("session disconnected");
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.retry_count = 0;
        });
    }

    /// Queue a frame for the live link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless the session is
    /// connected, or [`TransportError::Backpressure`] if the outbound queue
    /// is full.
    pub fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    /// Current session snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Subscribe to session snapshots.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}

fn set_state(status: &watch::Sender<SessionStatus>, state: ConnectionState, error: Option<String>) {
    status.send_modify(|s| {
        s.state = state;
        match state {
            ConnectionState::Connected => {
                s.retry_count = 0;
                s.last_error = None;
            }
            _ => {
                if error.is_some() {
                    s.last_error = error;
                }
            }
        }
    });
}

/// Why the frame pump stopped.
enum PumpExit {
    Shutdown,
    FeedClosed,
    Lost(String),
}

/// Background task owning the link for one session.
struct Supervisor<B: Backend> {
    backend: Arc<B>,
    identity: Identity,
    policy: ReconnectPolicy,
    status: Arc<watch::Sender<SessionStatus>>,
    outbound: mpsc::Receiver<ClientFrame>,
    feed: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
}

impl<B: Backend> Supervisor<B> {
    async fn run(mut self, mut link: B::Link) {
        loop {
            match self.pump(&link).await {
                PumpExit::Shutdown => {
                    link.close().await;
                    set_state(&self.status, ConnectionState::Disconnected, None);
                    let _ = self.feed.try_send(Inbound::Connection(
                        ConnectionEvent::Disconnected(DisconnectReason::Requested),
                    ));
                    return;
                }
                PumpExit::FeedClosed => {
                    tracing::debug!("session feed dropped, closing link");
                    link.close().await;
                    set_state(&self.status, ConnectionState::Disconnected, None);
                    return;
                }
                PumpExit::Lost(reason) => {
                    tracing::warn!(reason = %reason, "link lost");
                    link.close().await;
                    self.discard_queued();
                    set_state(
                        &self.status,
                        ConnectionState::Disconnected,
                        Some(reason.clone()),
                    );
                    let lost = ConnectionEvent::Disconnected(DisconnectReason::TransportLost(reason));
                    if !self.forward(Inbound::Connection(lost)).await {
                        return;
                    }
                    match self.reconnect().await {
                        Some(next) => link = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Move frames between the link, the outbound queue and the feed.
    async fn pump(&mut self, link: &B::Link) -> PumpExit {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return PumpExit::Shutdown,
                outgoing = self.outbound.recv() => {
                    let Some(frame) = outgoing else {
                        return PumpExit::Shutdown;
                    };
                    if let Err(e) = link.send(&frame).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }
                incoming = link.recv() => match incoming {
                    Ok(frame) => {
                        if !self.forward(Inbound::Frame(frame)).await {
                            return PumpExit::FeedClosed;
                        }
                    }
                    Err(e) => return PumpExit::Lost(e.to_string()),
                },
            }
        }
    }

    /// Retry with backoff until a link is live, shutdown is requested, or
    /// the backend rejects the credentials.
    async fn reconnect(&mut self) -> Option<B::Link> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.policy.delay_for(attempt);
            self.status.send_modify(|s| s.retry_count = attempt + 1);
            tracing::info!(attempt = attempt + 1, delay_ms = delay.as_millis(), "scheduling reconnect");

            tokio::select! {
                _ = self.shutdown.changed() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            set_state(&self.status, ConnectionState::Connecting, None);
            if !self.forward(Inbound::Connection(ConnectionEvent::Connecting)).await {
                return None;
            }

            let result = tokio::select! {
                _ = self.shutdown.changed() => return None,
                result = self.backend.connect(&self.identity) => result,
            };

            match result {
                Ok(link) => {
                    set_state(&self.status, ConnectionState::Connected, None);
                    tracing::info!(attempts = attempt + 1, "reconnected");
                    if !self.forward(Inbound::Connection(ConnectionEvent::Connected)).await {
                        link.close().await;
                        return None;
                    }
                    return Some(link);
                }
                Err(TransportError::AuthRejected(reason)) => {
                    tracing::warn!(reason = %reason, "credentials rejected on reconnect, giving up");
                    set_state(
                        &self.status,
                        ConnectionState::Disconnected,
                        Some(format!("authentication rejected: {reason}")),
                    );
                    let rejected = DisconnectReason::AuthRejected(reason);
                    let _ = self
                        .forward(Inbound::Connection(ConnectionEvent::Disconnected(rejected)))
                        .await;
                    return None;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, err = %e, "reconnect attempt failed");
                    let reason = e.to_string();
                    set_state(
                        &self.status,
                        ConnectionState::Disconnected,
                        Some(reason.clone()),
                    );
                    let failed = ConnectionEvent::Disconnected(DisconnectReason::TransportLost(reason));
                    if !self.forward(Inbound::Connection(failed)).await {
                        return None;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Deliver one feed item, giving up if shutdown is requested meanwhile.
    async fn forward(&mut self, item: Inbound) -> bool {
        tokio::select! {
            result = self.feed.send(item) => result.is_ok(),
            _ = self.shutdown.changed() => false,
        }
    }

    /// Drop frames queued for a link that no longer exists.
    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "discarded frames queued for lost link");
        }
    }
}
