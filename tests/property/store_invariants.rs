// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Property-based tests of the message store under arbitrary sync input.
//!
//! Drives a `Reconciler` with random interleavings of local sends, echoes
//! (with and without client ids), foreign messages, failures, resends and
//! full history replays, and checks after every step that:
//! 1. Every thread is ordered by `(created_at, key)`.
//! 2. No server id appears twice in a thread.
//! 3. Each distinct server record is represented by exactly one entry.

use std::collections::{HashMap, HashSet};

use chatsync::sync::reconciler::{ReconcileConfig, Reconciler};
use chatsync::sync::store::MessageStore;
use chatsync_proto::message::{
    ClientMessageId, ConversationId, MessageBody, MessageId, MessageRecord, Timestamp, UserId,
};
use proptest::prelude::*;
use tokio::time::Instant;

const CONVERSATIONS: [&str; 2] = ["general", "random"];
const TEXTS: [&str; 3] = ["hi", "ok", "same"];

#[derive(Debug, Clone)]
enum Op {
    Send { conversation: usize, text: usize },
    Echo { send: usize, with_client_id: bool, skew: u64 },
    Foreign { conversation: usize, text: usize, at: u64 },
    Fail { send: usize },
    Resend { send: usize },
    ReplayHistory,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CONVERSATIONS.len(), 0..TEXTS.len())
            .prop_map(|(conversation, text)| Op::Send { conversation, text }),
        3 => (any::<usize>(), any::<bool>(), 0u64..5_000)
            .prop_map(|(send, with_client_id, skew)| Op::Echo { send, with_client_id, skew }),
        2 => (0..CONVERSATIONS.len(), 0..TEXTS.len(), 0u64..100_000)
            .prop_map(|(conversation, text, at)| Op::Foreign { conversation, text, at }),
        1 => any::<usize>().prop_map(|send| Op::Fail { send }),
        1 => any::<usize>().prop_map(|send| Op::Resend { send }),
        1 => Just(Op::ReplayHistory),
    ]
}

fn alice() -> UserId {
    UserId::new("alice")
}

/// Drives a reconciler and remembers what the server has published.
struct Harness {
    reconciler: Reconciler,
    sends: Vec<(ClientMessageId, ConversationId, MessageBody, Timestamp)>,
    published: Vec<MessageRecord>,
    clock: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            reconciler: Reconciler::new(alice(), ReconcileConfig::default()),
            sends: Vec::new(),
            published: Vec::new(),
            clock: 1_000,
        }
    }

    fn tick(&mut self) -> Timestamp {
        self.clock += 10;
        Timestamp::from_millis(self.clock)
    }

    fn publish(&mut self, record: MessageRecord) {
        self.published.push(record.clone());
        self.reconciler.ingest_live(&record);
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Send { conversation, text } => {
                let conversation_id = ConversationId::new(CONVERSATIONS[conversation]);
                let body = MessageBody::text(TEXTS[text]);
                let created_at = self.tick();
                let client_id = self.reconciler.begin_send(
                    conversation_id.clone(),
                    body.clone(),
                    created_at,
                    Instant::now(),
                );
                self.sends.push((client_id, conversation_id, body, created_at));
            }
            Op::Echo {
                send,
                with_client_id,
                skew,
            } => {
                if self.sends.is_empty() {
                    return;
                }
                let (client_id, conversation_id, body, created_at) =
                    self.sends[send % self.sends.len()].clone();
                let id = MessageId::new(format!("m{}", self.published.len()));
                self.publish(MessageRecord {
                    id,
                    conversation_id,
                    sender_id: alice(),
                    body,
                    created_at: Timestamp::from_millis(created_at.as_millis() + skew),
                    client_id: with_client_id.then_some(client_id),
                });
            }
            Op::Foreign {
                conversation,
                text,
                at,
            } => {
                let id = MessageId::new(format!("m{}", self.published.len()));
                self.publish(MessageRecord {
                    id,
                    conversation_id: ConversationId::new(CONVERSATIONS[conversation]),
                    sender_id: UserId::new("bob"),
                    body: MessageBody::text(TEXTS[text]),
                    created_at: Timestamp::from_millis(at),
                    client_id: None,
                });
            }
            Op::Fail { send } => {
                if let Some((client_id, ..)) = self.sends.get(send % self.sends.len().max(1)) {
                    let client_id = client_id.clone();
                    self.reconciler.fail(&client_id);
                }
            }
            Op::Resend { send } => {
                if let Some((client_id, ..)) = self.sends.get(send % self.sends.len().max(1)) {
                    let client_id = client_id.clone();
                    let created_at = self.tick();
                    if let Some((conversation_id, body, fresh)) =
                        self.reconciler.resend(&client_id, created_at, Instant::now())
                    {
                        self.sends.push((fresh, conversation_id, body, created_at));
                    }
                }
            }
            Op::ReplayHistory => {
                let published = self.published.clone();
                self.reconciler.ingest_history(&published);
            }
        }
    }
}

fn check_invariants(store: &MessageStore, published: &[MessageRecord]) -> Result<(), TestCaseError> {
    let mut expected: HashMap<ConversationId, HashSet<MessageId>> = HashMap::new();
    for record in published {
        expected
            .entry(record.conversation_id.clone())
            .or_default()
            .insert(record.id.clone());
    }

    for name in CONVERSATIONS {
        let conversation_id = ConversationId::new(name);
        let messages = store.messages(&conversation_id);

        for pair in messages.windows(2) {
            let a = (pair[0].created_at, pair[0].key.as_str());
            let b = (pair[1].created_at, pair[1].key.as_str());
            prop_assert!(a <= b, "out of order: {:?} before {:?}", pair[0], pair[1]);
        }

        let mut seen = HashSet::new();
        for id in messages.iter().filter_map(|m| m.server_id()) {
            prop_assert!(seen.insert(id.clone()), "duplicate server id {id}");
        }
        let want = expected.remove(&conversation_id).unwrap_or_default();
        prop_assert_eq!(seen, want);
    }
    Ok(())
}

proptest! {
    /// Ordering and uniqueness hold after every step of any interleaving.
    #[test]
    fn store_stays_ordered_and_unique(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op);
            check_invariants(harness.reconciler.store(), &harness.published)?;
        }
    }

    /// Replaying the full history on top of the live stream changes nothing.
    #[test]
    fn history_replay_is_idempotent(ops in prop::collection::vec(arb_op(), 1..48)) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op);
        }
        let before: Vec<_> = CONVERSATIONS
            .iter()
            .map(|c| harness.reconciler.store().messages(&ConversationId::new(*c)))
            .collect();

        let published = harness.published.clone();
        prop_assert!(!harness.reconciler.ingest_history(&published));

        let after: Vec<_> = CONVERSATIONS
            .iter()
            .map(|c| harness.reconciler.store().messages(&ConversationId::new(*c)))
            .collect();
        prop_assert_eq!(before, after);
    }
}
