// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Property-based wire format tests.
//!
//! Uses proptest to verify:
//! 1. Any frame the client can send survives encode → decode.
//! 2. Any message record survives encode → decode inside a server frame.
//! 3. Arbitrary text never causes a panic in `decode`.
//! 4. Body normalization and validation agree with each other.

use chatsync_proto::codec;
use chatsync_proto::frame::{ClientFrame, ServerFrame};
use chatsync_proto::message::*;
use chatsync_proto::presence::PresenceUpdate;
use proptest::prelude::*;

// --- Strategies for protocol types ---

fn arb_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,24}"
}

fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
    arb_id().prop_map(ConversationId::new)
}

fn arb_user_id() -> impl Strategy<Value = UserId> {
    arb_id().prop_map(UserId::new)
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

/// Bodies with at least one non-empty part, as the client would send them.
fn arb_body() -> impl Strategy<Value = MessageBody> {
    (
        proptest::option::of("[^\x00]{1,256}"),
        proptest::option::of("https://img\\.example/[a-z]{1,16}\\.png"),
    )
        .prop_filter("needs text or image", |(t, i)| t.is_some() || i.is_some())
        .prop_map(|(text, image)| MessageBody::new(text, image))
}

fn arb_record() -> impl Strategy<Value = MessageRecord> {
    (
        arb_id(),
        arb_conversation_id(),
        arb_user_id(),
        arb_body(),
        arb_timestamp(),
        proptest::option::of(arb_id().prop_map(ClientMessageId::new)),
    )
        .prop_map(
            |(id, conversation_id, sender_id, body, created_at, client_id)| MessageRecord {
                id: MessageId::new(id),
                conversation_id,
                sender_id,
                body,
                created_at,
                client_id,
            },
        )
}

fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    prop_oneof![
        (arb_user_id(), "[ -~]{1,64}")
            .prop_map(|(user_id, token)| ClientFrame::Authenticate { user_id, token }),
        arb_conversation_id().prop_map(|conversation_id| ClientFrame::Subscribe { conversation_id }),
        arb_conversation_id()
            .prop_map(|conversation_id| ClientFrame::Unsubscribe { conversation_id }),
        (arb_conversation_id(), proptest::option::of(arb_timestamp())).prop_map(
            |(conversation_id, since)| ClientFrame::FetchHistory {
                conversation_id,
                since
            }
        ),
        (
            arb_conversation_id(),
            arb_body(),
            proptest::option::of(arb_id().prop_map(ClientMessageId::new))
        )
            .prop_map(|(conversation_id, body, client_id)| ClientFrame::Send(SendRequest {
                conversation_id,
                body,
                client_id
            })),
        arb_conversation_id().prop_map(|conversation_id| ClientFrame::Typing { conversation_id }),
        Just(ClientFrame::ListConversations),
    ]
}

// --- Property tests ---

proptest! {
    /// Every client frame survives an encode → decode round-trip.
    #[test]
    fn client_frame_round_trip(frame in arb_client_frame()) {
        let text = codec::encode(&frame).expect("encode should succeed");
        let decoded: ClientFrame = codec::decode(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Live and history deliveries preserve every record field.
    #[test]
    fn records_survive_server_frames(records in prop::collection::vec(arb_record(), 0..8)) {
        for record in &records {
            let text = codec::encode(&ServerFrame::Message(record.clone())).unwrap();
            let decoded: ServerFrame = codec::decode(&text).unwrap();
            prop_assert_eq!(decoded, ServerFrame::Message(record.clone()));
        }

        let batch = ServerFrame::History {
            conversation_id: ConversationId::new("c"),
            messages: records,
        };
        let text = codec::encode(&batch).unwrap();
        let decoded: ServerFrame = codec::decode(&text).unwrap();
        prop_assert_eq!(decoded, batch);
    }

    /// Presence updates keep their optional typing field.
    #[test]
    fn presence_round_trip(
        user_id in arb_user_id(),
        online in any::<bool>(),
        typing in proptest::option::of(arb_conversation_id()),
    ) {
        let frame = ServerFrame::Presence(PresenceUpdate {
            user_id,
            online,
            typing_in_conversation_id: typing,
        });
        let text = codec::encode(&frame).unwrap();
        let decoded: ServerFrame = codec::decode(&text).unwrap();
        prop_assert_eq!(frame, decoded);
    }

    /// Arbitrary text never causes a panic when decoded.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode::<ServerFrame>(&text);
        let _ = codec::decode::<ClientFrame>(&text);
    }

    /// A normalized body validates unless both parts are empty.
    #[test]
    fn normalized_bodies_validate(text in ".{0,64}", image in ".{0,64}") {
        let body = MessageBody::new(Some(text.clone()), Some(image.clone()));
        prop_assert_eq!(body.text.is_none(), text.is_empty());
        prop_assert_eq!(body.image.is_none(), image.is_empty());
        let valid = body.validate().is_ok();
        prop_assert_eq!(valid, !text.is_empty() || !image.is_empty());
    }
}
