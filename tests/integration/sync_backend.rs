// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::doc_markdown
)]

//! End-to-end synchronization against the in-process reference backend.
//!
//! Each test starts `chatsync-backend` on `127.0.0.1:0` and connects real
//! `SyncClient`s through the WebSocket transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatsync::connection::{ConnectError, ConnectionState, ReconnectPolicy};
use chatsync::session::Identity;
use chatsync::sync::router::SubscriptionState;
use chatsync::sync::store::DeliveryState;
use chatsync::sync::{FetchState, SyncClient, SyncConfig, SyncEvent};
use chatsync::transport::ws::WsBackend;
use chatsync_backend::server::{self, BackendState};
use chatsync_backend::store::ConversationStore;
use chatsync_proto::message::{ConversationId, MessageBody, UserId};
use tokio::sync::mpsc;

type Client = SyncClient<WsBackend>;

async fn start_backend(state: Arc<BackendState>) -> String {
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start backend");
    format!("ws://{addr}/ws")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_secs(1),
        },
        sweep_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

async fn login(url: &str, user: &str) -> (Client, mpsc::Receiver<SyncEvent>) {
    SyncClient::start(
        Arc::new(WsBackend::new(url)),
        Identity::new(UserId::new(user), format!("{user}-token")),
        fast_config(),
    )
    .await
    .expect("login failed")
}

/// Poll `condition` until it holds or five seconds pass.
async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn texts(client: &Client, conversation: &ConversationId) -> Vec<String> {
    client
        .messages(conversation)
        .into_iter()
        .filter_map(|m| m.body.text)
        .collect()
}

#[tokio::test]
async fn message_flows_between_two_clients() {
    let url = start_backend(Arc::new(BackendState::new())).await;
    let general = ConversationId::new("general");

    let (alice, _alice_events) = login(&url, "alice").await;
    let (bob, _bob_events) = login(&url, "bob").await;
    alice.set_active_conversation(Some(general.clone()));
    bob.set_active_conversation(Some(general.clone()));
    wait_until("both subscribed", || {
        alice.subscription_state() == SubscriptionState::Subscribed
            && bob.subscription_state() == SubscriptionState::Subscribed
    })
    .await;

    let tmp = alice.send("hello bob", None).unwrap();
    let pending = alice.active_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].client_id(), Some(&tmp));

    wait_until("echo confirmed", || {
        alice
            .active_messages()
            .first()
            .is_some_and(|m| m.state == DeliveryState::Sent)
    })
    .await;
    wait_until("bob received", || bob.active_messages().len() == 1).await;

    let on_alice = alice.active_messages();
    let on_bob = bob.active_messages();
    assert_eq!(on_alice.len(), 1);
    assert_eq!(on_alice[0].server_id(), on_bob[0].server_id());
    assert_eq!(on_bob[0].sender_id, UserId::new("alice"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn opening_a_conversation_loads_its_history() {
    let state = Arc::new(BackendState::new());
    let general = ConversationId::new("general");
    for text in ["one", "two", "three"] {
        state
            .store
            .append(&general, &UserId::new("bob"), MessageBody::text(text), None)
            .await;
    }
    let url = start_backend(state).await;

    let (alice, _events) = login(&url, "alice").await;
    alice.set_active_conversation(Some(general.clone()));
    assert!(alice.is_loading(&general));
    wait_until("history loaded", || {
        alice.fetch_state(&general) == FetchState::Loaded
    })
    .await;

    assert_eq!(texts(&alice, &general), vec!["one", "two", "three"]);
    alice.shutdown().await;
}

#[tokio::test]
async fn switching_conversations_stops_the_old_stream() {
    let url = start_backend(Arc::new(BackendState::new())).await;
    let first = ConversationId::new("first");
    let second = ConversationId::new("second");

    let (alice, _alice_events) = login(&url, "alice").await;
    let (bob, _bob_events) = login(&url, "bob").await;
    alice.set_active_conversation(Some(first.clone()));
    wait_until("alice subscribed", || {
        alice.subscription_state() == SubscriptionState::Subscribed
    })
    .await;
    alice.set_active_conversation(Some(second.clone()));
    wait_until("alice resubscribed", || {
        alice.subscription_state() == SubscriptionState::Subscribed
    })
    .await;

    bob.set_active_conversation(Some(first.clone()));
    bob.send("into the old room", None).unwrap();
    bob.set_active_conversation(Some(second.clone()));
    bob.send("into the new room", None).unwrap();

    wait_until("alice got the new message", || {
        texts(&alice, &second) == vec!["into the new room"]
    })
    .await;
    assert!(alice.messages(&first).is_empty());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn presence_and_typing_reach_peers() {
    let url = start_backend(Arc::new(BackendState::new())).await;
    let general = ConversationId::new("general");

    let (alice, _alice_events) = login(&url, "alice").await;
    let (bob, _bob_events) = login(&url, "bob").await;
    wait_until("alice sees bob", || {
        alice.online_users() == vec![UserId::new("bob")]
    })
    .await;
    wait_until("bob sees alice", || {
        bob.online_users() == vec![UserId::new("alice")]
    })
    .await;

    bob.set_active_conversation(Some(general.clone()));
    wait_until("bob connected", || {
        bob.subscription_state() == SubscriptionState::Subscribed
    })
    .await;
    assert!(bob.notify_typing());
    wait_until("alice sees typing", || {
        alice.is_typing(&UserId::new("bob"), &general)
    })
    .await;

    bob.shutdown().await;
    wait_until("bob offline", || alice.online_users().is_empty()).await;
    alice.shutdown().await;
}

#[tokio::test]
async fn conversation_list_reflects_membership() {
    let state = Arc::new(BackendState::new());
    state
        .store
        .join(&ConversationId::new("team"), &UserId::new("alice"))
        .await;
    state
        .store
        .join(&ConversationId::new("private"), &UserId::new("bob"))
        .await;
    let url = start_backend(state).await;

    let (alice, mut events) = login(&url, "alice").await;
    wait_until("conversation list", || alice.conversations().len() == 1).await;
    assert_eq!(alice.conversations()[0].id, ConversationId::new("team"));

    let mut saw_list = false;
    while let Ok(event) = events.try_recv() {
        saw_list |= event == SyncEvent::ConversationsChanged;
    }
    assert!(saw_list);
    alice.shutdown().await;
}

#[tokio::test]
async fn server_restart_of_sessions_resumes_the_subscription() {
    let state = Arc::new(BackendState::new());
    let url = start_backend(Arc::clone(&state)).await;
    let general = ConversationId::new("general");

    let (alice, _events) = login(&url, "alice").await;
    alice.set_active_conversation(Some(general.clone()));
    wait_until("subscribed", || {
        alice.subscription_state() == SubscriptionState::Subscribed
    })
    .await;

    state.close_all_connections().await;
    // Posted while alice is away; the post-reconnect fetch must bring it in.
    state
        .store
        .append(&general, &UserId::new("bob"), MessageBody::text("missed"), None)
        .await;

    wait_until("reconnected", || {
        alice.connection_status().state == ConnectionState::Connected
            && alice.subscription_state() == SubscriptionState::Subscribed
    })
    .await;
    wait_until("missed message merged", || {
        texts(&alice, &general) == vec!["missed"]
    })
    .await;

    // The resumed stream is live.
    let (bob, _bob_events) = login(&url, "bob").await;
    bob.set_active_conversation(Some(general.clone()));
    bob.send("after", None).unwrap();
    wait_until("live after reconnect", || {
        texts(&alice, &general) == vec!["missed", "after"]
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn wrong_token_is_rejected_at_login() {
    let tokens = HashMap::from([("alice".to_string(), "alice-token".to_string())]);
    let state = Arc::new(BackendState::with_config(
        64 * 1024,
        ConversationStore::new(),
        Some(tokens),
    ));
    let url = start_backend(state).await;

    let result = SyncClient::start(
        Arc::new(WsBackend::new(&url)),
        Identity::new(UserId::new("alice"), "guess"),
        fast_config(),
    )
    .await;
    assert!(matches!(result, Err(ConnectError::AuthRejected(_))));

    let (alice, _events) = login(&url, "alice").await;
    assert_eq!(alice.connection_status().state, ConnectionState::Connected);
    alice.shutdown().await;
}

#[tokio::test]
async fn unreachable_backend_is_reported() {
    let result = SyncClient::start(
        Arc::new(WsBackend::new("ws://127.0.0.1:1/ws")),
        Identity::new(UserId::new("alice"), "t"),
        fast_config(),
    )
    .await;
    assert!(matches!(result, Err(ConnectError::TransportUnavailable(_))));
}
