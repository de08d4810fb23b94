//! Loopback backend for testing.
//!
//! [`LoopbackBackend`] plays both roles: the client side hands it to a
//! connection manager as its [`Backend`], and the test keeps a clone to act
//! as the server. Every `connect` opens a fresh [`LoopbackLink`] over
//! in-process [`tokio::sync::mpsc`] channels; the server side can push
//! frames to the current link, read what the client sent, sever the link,
//! refuse credentials, or make the backend unreachable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};

use chatsync_proto::frame::{ClientFrame, ServerFrame};
use chatsync_proto::message::UserId;

use super::{Backend, Link, TransportError};
use crate::session::Identity;

/// In-process backend whose server side is driven by the test.
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: parking_lot::Mutex<State>,
    inbox_ready: Notify,
}

#[derive(Default)]
struct State {
    current: Option<CurrentLink>,
    next_link_id: u64,
    connect_count: usize,
    reject_reason: Option<String>,
    unavailable: bool,
    last_user: Option<UserId>,
    /// Client frames not yet consumed by [`LoopbackBackend::recv_client_frame`].
    inbox: VecDeque<ClientFrame>,
    /// Every client frame ever sent, in order.
    log: Vec<ClientFrame>,
}

struct CurrentLink {
    id: u64,
    tx: mpsc::UnboundedSender<ServerFrame>,
    connected: Arc<AtomicBool>,
}

impl LoopbackBackend {
    /// Create a reachable backend that accepts any credentials.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `frame` to the current link. Returns `false` if no link is open.
    pub fn push(&self, frame: ServerFrame) -> bool {
        let state = self.shared.state.lock();
        state
            .current
            .as_ref()
            .is_some_and(|link| link.tx.send(frame).is_ok())
    }

    /// Wait for the next frame sent by the client.
    pub async fn recv_client_frame(&self) -> ClientFrame {
        loop {
            let notified = self.shared.inbox_ready.notified();
            if let Some(frame) = self.shared.state.lock().inbox.pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    /// Take every client frame received so far without waiting.
    pub fn drain_client_frames(&self) -> Vec<ClientFrame> {
        self.shared.state.lock().inbox.drain(..).collect()
    }

    /// Snapshot of every client frame ever sent, across all links.
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.shared.state.lock().log.clone()
    }

    /// Drop the current link as if the network failed.
    pub fn sever(&self) {
        let mut state = self.shared.state.lock();
        if let Some(link) = state.current.take() {
            link.connected.store(false, Ordering::Relaxed);
            tracing::debug!(link_id = link.id, "loopback link severed");
        }
    }

    /// Make subsequent connects fail with `AuthRejected(reason)`, or accept
    /// again with `None`.
    pub fn reject_auth(&self, reason: Option<&str>) {
        self.shared.state.lock().reject_reason = reason.map(str::to_string);
    }

    /// Make subsequent connects fail as unreachable while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.shared.state.lock().connect_count
    }

    /// Whether a link is currently open.
    pub fn has_link(&self) -> bool {
        self.shared.state.lock().current.is_some()
    }

    /// User id presented by the most recent successful connect.
    pub fn last_user(&self) -> Option<UserId> {
        self.shared.state.lock().last_user.clone()
    }
}

impl Backend for LoopbackBackend {
    type Link = LoopbackLink;

    async fn connect(&self, identity: &Identity) -> Result<LoopbackLink, TransportError> {
        let mut state = self.shared.state.lock();
        if state.unavailable {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }
        if let Some(reason) = &state.reject_reason {
            return Err(TransportError::AuthRejected(reason.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let id = state.next_link_id;
        state.next_link_id += 1;
        state.connect_count += 1;
        state.last_user = Some(identity.user_id.clone());

        // A newer connect replaces whatever link was open.
        if let Some(old) = state.current.replace(CurrentLink {
            id,
            tx,
            connected: Arc::clone(&connected),
        }) {
            old.connected.store(false, Ordering::Relaxed);
        }
        drop(state);

        tracing::debug!(link_id = id, user_id = %identity.user_id, "loopback link opened");
        Ok(LoopbackLink {
            id,
            shared: Arc::clone(&self.shared),
            incoming: Mutex::new(rx),
            connected,
        })
    }
}

/// Client end of one loopback session.
pub struct LoopbackLink {
    id: u64,
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::UnboundedReceiver<ServerFrame>>,
    connected: Arc<AtomicBool>,
}

impl Link for LoopbackLink {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut state = self.shared.state.lock();
        state.log.push(frame.clone());
        state.inbox.push_back(frame.clone());
        drop(state);
        self.shared.inbox_ready.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<ServerFrame, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if state.current.as_ref().is_some_and(|link| link.id == self.id) {
            state.current = None;
        }
    }
}
