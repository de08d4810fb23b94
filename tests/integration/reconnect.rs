// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::doc_markdown
)]

//! Reconnection behavior of the sync client over the loopback backend.
//!
//! Every test runs on tokio's paused clock, so backoff delays and send
//! timeouts elapse instantly but in a deterministic order. The loopback
//! backend lets the test play the server: it sees every client frame and
//! pushes server frames at exact points.

use std::sync::Arc;
use std::time::Duration;

use chatsync::connection::{ConnectionEvent, ConnectionState, DisconnectReason};
use chatsync::session::Identity;
use chatsync::sync::store::DeliveryState;
use chatsync::sync::{SendFailure, SyncClient, SyncConfig, SyncEvent};
use chatsync::transport::loopback::LoopbackBackend;
use chatsync_proto::frame::{ClientFrame, ServerFrame};
use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, MessageId, MessageRecord, Timestamp, UserId,
};
use tokio::sync::mpsc;

fn conv() -> ConversationId {
    ConversationId::new("general")
}

fn echo(id: &str, text: &str, client_id: Option<ClientMessageId>) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        conversation_id: conv(),
        sender_id: UserId::new("alice"),
        body: MessageBody::text(text),
        created_at: Timestamp::now(),
        client_id,
    }
}

/// Let queued frames flow through the supervisor and engine.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn drain_events(events: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Start a client for alice with `general` open and confirmed.
async fn start_in_conversation() -> (
    LoopbackBackend,
    SyncClient<LoopbackBackend>,
    mpsc::Receiver<SyncEvent>,
) {
    let backend = LoopbackBackend::new();
    let (client, events) = SyncClient::start(
        Arc::new(backend.clone()),
        Identity::new(UserId::new("alice"), "token"),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    client.set_active_conversation(Some(conv()));
    backend.push(ServerFrame::Subscribed {
        conversation_id: conv(),
    });
    backend.push(ServerFrame::History {
        conversation_id: conv(),
        messages: Vec::new(),
    });
    settle().await;
    backend.drain_client_frames();
    (backend, client, events)
}

/// Sever the link and wait out the first backoff step.
async fn drop_and_reconnect(backend: &LoopbackBackend) {
    backend.sever();
    settle().await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_exactly_once() {
    let (backend, client, mut events) = start_in_conversation().await;
    let history = vec![echo("m1", "before", None)];
    backend.push(ServerFrame::Message(history[0].clone()));
    settle().await;
    drain_events(&mut events);

    drop_and_reconnect(&backend).await;

    assert_eq!(backend.connect_count(), 2);
    assert_eq!(client.connection_status().state, ConnectionState::Connected);

    let frames = backend.drain_client_frames();
    let subscribes = frames
        .iter()
        .filter(|f| matches!(f, ClientFrame::Subscribe { .. }))
        .count();
    assert_eq!(subscribes, 1, "frames: {frames:?}");
    assert!(frames.contains(&ClientFrame::FetchHistory {
        conversation_id: conv(),
        since: Some(history[0].created_at),
    }));
    assert!(
        !frames
            .iter()
            .any(|f| matches!(f, ClientFrame::Unsubscribe { .. }))
    );

    let seen = drain_events(&mut events);
    let lost = seen.iter().position(|e| {
        matches!(
            e,
            SyncEvent::ConnectionChanged(ConnectionEvent::Disconnected(
                DisconnectReason::TransportLost(_)
            ))
        )
    });
    let back = seen
        .iter()
        .position(|e| *e == SyncEvent::ConnectionChanged(ConnectionEvent::Connected));
    assert!(lost.is_some() && back.is_some() && lost < back, "events: {seen:?}");
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn link_lost_before_first_history_refetches_everything() {
    let backend = LoopbackBackend::new();
    let (client, _events) = SyncClient::start(
        Arc::new(backend.clone()),
        Identity::new(UserId::new("alice"), "token"),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    client.set_active_conversation(Some(conv()));
    settle().await;

    // A live message overtakes the history answer, then the link drops.
    let mut live = echo("m2", "live", None);
    live.sender_id = UserId::new("bob");
    live.created_at = Timestamp::from_millis(50);
    backend.push(ServerFrame::Message(live.clone()));
    settle().await;
    backend.drain_client_frames();

    drop_and_reconnect(&backend).await;
    let frames = backend.drain_client_frames();
    assert!(
        frames.contains(&ClientFrame::FetchHistory {
            conversation_id: conv(),
            since: None,
        }),
        "frames: {frames:?}"
    );

    let mut older = echo("m1", "older", None);
    older.sender_id = UserId::new("bob");
    older.created_at = Timestamp::from_millis(10);
    backend.push(ServerFrame::History {
        conversation_id: conv(),
        messages: vec![older, live],
    });
    settle().await;

    let texts: Vec<_> = client
        .active_messages()
        .into_iter()
        .filter_map(|m| m.body.text)
        .collect();
    assert_eq!(texts, vec!["older", "live"]);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_and_live_echo_of_one_send_do_not_duplicate() {
    let (backend, client, _events) = start_in_conversation().await;
    let tmp = client.send("hi", None).unwrap();
    settle().await;
    assert!(matches!(
        backend.drain_client_frames().as_slice(),
        [ClientFrame::Send(_)]
    ));

    // The live echo was lost with the link; the refetch carries it, then a
    // delayed copy of the live event arrives as well.
    drop_and_reconnect(&backend).await;
    let record = echo("m1", "hi", Some(tmp));
    backend.push(ServerFrame::History {
        conversation_id: conv(),
        messages: vec![record.clone()],
    });
    backend.push(ServerFrame::Message(record));
    settle().await;

    let messages = client.active_messages();
    assert_eq!(messages.len(), 1, "messages: {messages:?}");
    assert_eq!(messages[0].state, DeliveryState::Sent);
    assert_eq!(messages[0].server_id(), Some(&MessageId::new("m1")));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn echo_without_client_id_is_matched_by_content() {
    let (backend, client, _events) = start_in_conversation().await;
    client.send("same", None).unwrap();
    client.send("same", None).unwrap();
    settle().await;

    backend.push(ServerFrame::Message(echo("m1", "same", None)));
    settle().await;
    let states: Vec<_> = client.active_messages().iter().map(|m| m.state).collect();
    assert_eq!(states.len(), 2);
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == DeliveryState::Pending)
            .count(),
        1
    );

    backend.push(ServerFrame::Message(echo("m2", "same", None)));
    settle().await;
    let messages = client.active_messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.state == DeliveryState::Sent));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_send_times_out_and_can_be_resent() {
    let (backend, client, mut events) = start_in_conversation().await;
    let tmp = client.send("hello", None).unwrap();
    settle().await;
    drain_events(&mut events);

    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;

    let messages = client.active_messages();
    assert_eq!(messages[0].state, DeliveryState::Failed);
    assert!(drain_events(&mut events).contains(&SyncEvent::SendFailed {
        conversation_id: conv(),
        client_id: tmp.clone(),
        reason: SendFailure::Timeout,
    }));

    backend.drain_client_frames();
    let fresh = client.resend(&tmp).unwrap();
    assert_ne!(fresh, tmp);
    settle().await;
    match backend.drain_client_frames().as_slice() {
        [ClientFrame::Send(request)] => {
            assert_eq!(request.client_id, Some(fresh.clone()));
            assert_eq!(request.body, MessageBody::text("hello"));
        }
        other => panic!("expected one Send, got {other:?}"),
    }

    backend.push(ServerFrame::Message(echo("m1", "hello", Some(fresh))));
    settle().await;
    let messages = client.active_messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| m.state == DeliveryState::Sent));
    assert!(
        messages
            .iter()
            .any(|m| m.state == DeliveryState::Failed && m.client_id() == Some(&tmp))
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_echo_promotes_failed_send() {
    let (backend, client, _events) = start_in_conversation().await;
    let tmp = client.send("slow", None).unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(client.active_messages()[0].state, DeliveryState::Failed);

    backend.push(ServerFrame::Message(echo("m1", "slow", Some(tmp))));
    settle().await;
    let messages = client.active_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].state, DeliveryState::Sent);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn send_timeout_does_not_run_while_disconnected() {
    let (backend, client, _events) = start_in_conversation().await;
    let tmp = client.send("patient", None).unwrap();
    settle().await;

    backend.set_unavailable(true);
    backend.sever();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_ne!(client.connection_status().state, ConnectionState::Connected);
    assert_eq!(client.active_messages()[0].state, DeliveryState::Pending);

    // Attempts run at 1, 3, 7, 15 and 31 seconds after the loss.
    backend.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(12)).await;
    settle().await;
    assert_eq!(client.connection_status().state, ConnectionState::Connected);
    assert_eq!(client.active_messages()[0].state, DeliveryState::Pending);

    backend.push(ServerFrame::Message(echo("m1", "patient", Some(tmp))));
    settle().await;
    assert_eq!(client.active_messages()[0].state, DeliveryState::Sent);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn presence_is_rebuilt_after_reconnect() {
    let (backend, client, _events) = start_in_conversation().await;
    backend.push(ServerFrame::Presence(
        chatsync_proto::presence::PresenceUpdate {
            user_id: UserId::new("bob"),
            online: true,
            typing_in_conversation_id: None,
        },
    ));
    settle().await;
    assert_eq!(client.online_users(), vec![UserId::new("bob")]);

    drop_and_reconnect(&backend).await;
    assert!(client.online_users().is_empty());
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_on_reconnect_end_the_session() {
    let (backend, client, mut events) = start_in_conversation().await;
    drain_events(&mut events);

    backend.reject_auth(Some("token expired"));
    drop_and_reconnect(&backend).await;

    let seen = drain_events(&mut events);
    assert!(
        seen.contains(&SyncEvent::AuthRejected {
            reason: "token expired".into()
        }),
        "events: {seen:?}"
    );
    assert_eq!(
        client.connection_status().state,
        ConnectionState::Disconnected
    );

    // No further attempts are made.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.connect_count(), 1);
    client.shutdown().await;
}
