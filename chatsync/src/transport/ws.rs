//! WebSocket transport for `ChatSync`.
//!
//! Implements [`Backend`] and [`Link`] over a WebSocket connection carrying
//! one JSON frame per text message. The handshake sends `Authenticate` and
//! waits for `Welcome` (or `AuthRejected`) before the link is handed out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chatsync_proto::codec;
use chatsync_proto::frame::{ClientFrame, ServerFrame};

use super::{Backend, Link, TransportError};
use crate::session::Identity;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the authentication handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the channel between the reader task and [`WsLink::recv`].
const INCOMING_BUFFER: usize = 256;

/// Opens [`WsLink`]s to a backend at a fixed `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsBackend {
    url: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WsBackend {
    /// Creates a backend for `url` with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Overrides the connect and handshake timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// Return the backend URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Backend for WsBackend {
    type Link = WsLink;

    /// Connect and authenticate.
    ///
    /// 1. Establishes the WebSocket connection (connect timeout)
    /// 2. Sends `Authenticate` with the identity's user id and token
    /// 3. Waits for `Welcome` or `AuthRejected` (handshake timeout)
    /// 4. Spawns a background reader task
    async fn connect(&self, identity: &Identity) -> Result<WsLink, TransportError> {
        let url = self.url.as_str();
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "backend WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "backend WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = codec::encode(&ClientFrame::Authenticate {
            user_id: identity.user_id.clone(),
            token: identity.token.clone(),
        })?;
        ws_sender
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send Authenticate frame");
                TransportError::Io(std::io::Error::other(format!(
                    "failed to send Authenticate: {e}"
                )))
            })?;

        let reply = tokio::time::timeout(self.handshake_timeout, next_server_frame(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url, "authentication handshake timed out");
                TransportError::Timeout
            })??;

        match reply {
            ServerFrame::Welcome { user_id } => {
                tracing::info!(user_id = %user_id, url, "authenticated with backend");
            }
            ServerFrame::AuthRejected { reason } => {
                tracing::warn!(reason = %reason, "backend rejected credentials");
                return Err(TransportError::AuthRejected(reason));
            }
            other => {
                tracing::warn!(?other, "unexpected frame during handshake");
                return Err(TransportError::Io(std::io::Error::other(
                    "unexpected frame during handshake",
                )));
            }
        }

        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(WsLink {
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

/// An authenticated WebSocket session.
pub struct WsLink {
    /// Write half of the WebSocket connection.
    ws_sender: Mutex<WsSender>,
    /// Frames decoded by the background reader task.
    incoming: Mutex<mpsc::Receiver<ServerFrame>>,
    /// Whether the WebSocket connection is still open.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl Link for WsLink {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode(frame)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "backend send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
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
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "error while closing backend WebSocket");
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Read frames until the first decodable [`ServerFrame`] arrives.
async fn next_server_frame(ws_reader: &mut WsReader) -> Result<ServerFrame, TransportError> {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => return Ok(codec::decode(text.as_str())?),
            Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Background task that decodes incoming text frames.
///
/// Malformed frames are logged and skipped; the task does not disconnect on
/// bad data. Sets `connected` to `false` when the WebSocket closes or errors.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerFrame>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode::<ServerFrame>(text.as_str()) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        // Link dropped.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed backend frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("backend WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame from backend");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "backend WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("backend reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "backend HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "backend connection error: {other}"
        ))),
    }
}
