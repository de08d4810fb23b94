// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::doc_markdown
)]

//! Login and logout through `SessionHost` against the reference backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatsync::connection::{ConnectError, ConnectionState};
use chatsync::session::{Identity, SessionHost};
use chatsync::sync::router::SubscriptionState;
use chatsync::sync::{SyncConfig, SyncEvent};
use chatsync::transport::ws::WsBackend;
use chatsync_backend::server::{self, BackendState};
use chatsync_backend::store::ConversationStore;
use chatsync_proto::message::{ConversationId, UserId};

async fn start_backend() -> (Arc<BackendState>, String) {
    let tokens = HashMap::from([
        ("alice".to_string(), "alice-token".to_string()),
        ("bob".to_string(), "bob-token".to_string()),
    ]);
    let state = Arc::new(BackendState::with_config(
        64 * 1024,
        ConversationStore::new(),
        Some(tokens),
    ));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start backend");
    (state, format!("ws://{addr}/ws"))
}

fn host(url: &str) -> SessionHost<WsBackend> {
    SessionHost::new(Arc::new(WsBackend::new(url)), SyncConfig::default())
}

/// Poll the backend until it reports `count` live sessions.
async fn wait_for_sessions(state: &BackendState, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.session_count().await != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} sessions"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn login_creates_and_logout_destroys_the_session() {
    let (state, url) = start_backend().await;
    let mut host = host(&url);
    assert!(!host.is_authenticated());

    let mut events = host
        .on_login(Identity::new(UserId::new("alice"), "alice-token"))
        .await
        .unwrap();
    assert!(host.is_authenticated());
    let client = host.client().unwrap().clone();
    assert_eq!(client.connection_status().state, ConnectionState::Connected);
    wait_for_sessions(&state, 1).await;

    host.on_logout().await;
    assert!(!host.is_authenticated());
    assert_eq!(
        client.connection_status().state,
        ConnectionState::Disconnected
    );
    wait_for_sessions(&state, 0).await;

    // The stream ends with the session.
    drop(client);
    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert!(matches!(last, Some(SyncEvent::ConnectionChanged(_))));
}

#[tokio::test]
async fn logging_in_again_switches_user() {
    let (state, url) = start_backend().await;
    let mut host = host(&url);

    host.on_login(Identity::new(UserId::new("alice"), "alice-token"))
        .await
        .unwrap();
    host.client()
        .unwrap()
        .set_active_conversation(Some(ConversationId::new("general")));

    host.on_login(Identity::new(UserId::new("bob"), "bob-token"))
        .await
        .unwrap();
    let client = host.client().unwrap();
    assert_eq!(client.local_user(), UserId::new("bob"));
    // Nothing carries over from the previous session.
    assert_eq!(client.active_conversation(), None);
    assert_eq!(client.subscription_state(), SubscriptionState::Idle);

    wait_for_sessions(&state, 1).await;
    assert_eq!(state.online_users().await, vec![UserId::new("bob")]);
    host.on_logout().await;
}

#[tokio::test]
async fn rejected_login_keeps_the_host_logged_out() {
    let (_state, url) = start_backend().await;
    let mut host = host(&url);

    let result = host
        .on_login(Identity::new(UserId::new("alice"), "bob-token"))
        .await;
    assert!(matches!(result, Err(ConnectError::AuthRejected(_))));
    assert!(!host.is_authenticated());
    assert!(host.client().is_none());
}

#[tokio::test]
async fn failed_login_ends_the_previous_session() {
    let (state, url) = start_backend().await;
    let mut host = host(&url);
    host.on_login(Identity::new(UserId::new("alice"), "alice-token"))
        .await
        .unwrap();

    let result = host
        .on_login(Identity::new(UserId::new("bob"), "wrong"))
        .await;
    assert!(result.is_err());
    assert!(!host.is_authenticated());
    wait_for_sessions(&state, 0).await;
}
