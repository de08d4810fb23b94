//! Authentication lifecycle: identities and the per-login sync context.
//!
//! A [`SessionHost`] owns at most one [`SyncClient`]. Logging in creates it
//! (connecting to the backend), logging out tears it down. Whether the user
//! is authenticated is simply whether a session exists.

use std::sync::Arc;

use tokio::sync::mpsc;

use chatsync_proto::message::UserId;

use crate::connection::ConnectError;
use crate::sync::{SyncClient, SyncConfig, SyncEvent};
use crate::transport::Backend;

/// Credentials of an authenticated user as issued by the login flow.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// The user.
    pub user_id: UserId,
    /// Opaque credential presented to the backend.
    pub token: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Creates a sync context on login and discards it on logout.
pub struct SessionHost<B: Backend> {
    backend: Arc<B>,
    config: SyncConfig,
    client: Option<SyncClient<B>>,
}

impl<B: Backend> SessionHost<B> {
    /// Create a host with no active session.
    pub const fn new(backend: Arc<B>, config: SyncConfig) -> Self {
        Self {
            backend,
            config,
            client: None,
        }
    }

    /// Start a session for `identity`, ending any previous one first.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the backend rejects the identity or
    /// cannot be reached; the host is then logged out.
    pub async fn on_login(
        &mut self,
        identity: Identity,
    ) -> Result<mpsc::Receiver<SyncEvent>, ConnectError> {
        self.on_logout().await;
        let user_id = identity.user_id.clone();
        let (client, events) =
            SyncClient::start(Arc::clone(&self.backend), identity, self.config).await?;
        tracing::info!(user_id = %user_id, "logged in");
        self.client = Some(client);
        Ok(events)
    }

    /// End the current session, if any. Idempotent.
    pub async fn on_logout(&mut self) {
        if let Some(client) = self.client.take() {
            let user_id = client.local_user();
            client.shutdown().await;
            tracing::info!(user_id = %user_id, "logged out");
        }
    }

    /// Whether a session exists.
    pub const fn is_authenticated(&self) -> bool {
        self.client.is_some()
    }

    /// The current session.
    pub const fn client(&self) -> Option<&SyncClient<B>> {
        self.client.as_ref()
    }
}
