//! Transport layer abstraction for `ChatSync`.
//!
//! Defines the [`Backend`] trait (how to open an authenticated session) and
//! the [`Link`] trait (one live, authenticated session carrying frames).
//! Concrete implementations:
//! - [`ws::WsBackend`]: JSON frames over a WebSocket connection
//! - [`loopback::LoopbackBackend`]: in-process channels for testing

pub mod loopback;
pub mod ws;

use std::future::Future;

use chatsync_proto::codec::CodecError;
use chatsync_proto::frame::{ClientFrame, ServerFrame};

use crate::session::Identity;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The backend refused the presented credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The connection to the backend has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No session is currently established.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    Backpressure,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("backend {0} is unreachable")]
    Unreachable(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens authenticated sessions to a messaging backend.
///
/// `connect` performs the whole handshake: it returns only once the backend
/// has accepted the identity, so a returned [`Link`] is immediately usable.
pub trait Backend: Send + Sync + 'static {
    /// The session type produced by this backend.
    type Link: Link;

    /// Open a new session for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AuthRejected`] if the backend refuses the
    /// credentials, or another [`TransportError`] if the backend cannot be
    /// reached.
    fn connect(
        &self,
        identity: &Identity,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One live, authenticated session with the backend.
///
/// A link never reconnects by itself. Once [`recv`](Link::recv) reports an
/// error the link is dead and the owner must open a new one.
pub trait Link: Send + Sync + 'static {
    /// Send one frame to the backend.
    fn send(&self, frame: &ClientFrame)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame from the backend.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// frame.
    fn recv(&self) -> impl Future<Output = Result<ServerFrame, TransportError>> + Send;

    /// Whether the link still considers itself connected.
    fn is_connected(&self) -> bool;

    /// Close the link gracefully.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
