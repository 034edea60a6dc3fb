use super::*;

use shared::domain::UserStatus;
use tokio::sync::mpsc;

struct Harness {
    router: DeliveryRouter,
    registry: Arc<SessionRegistry>,
    storage: Storage,
}

async fn setup() -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let registry = Arc::new(SessionRegistry::new());
    let router = DeliveryRouter::new(registry.clone(), storage.clone());
    Harness {
        router,
        registry,
        storage,
    }
}

impl Harness {
    async fn seed_user(&self, username: &str) -> UserId {
        self.storage
            .create_user(username, "hash")
            .await
            .expect("user")
    }

    fn connect(&self) -> (ClientHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(self.registry.issue_conn_id(), tx), rx)
    }

    async fn authed_connection(
        &self,
        user_id: UserId,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (handle, rx) = self.connect();
        self.router
            .handle_frame(&handle, ClientFrame::Auth { user_id })
            .await;
        (handle, rx)
    }

    async fn status_of(&self, user_id: UserId) -> UserStatus {
        self.storage
            .user_by_id(user_id)
            .await
            .expect("user")
            .expect("row")
            .status
    }

    async fn message_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(self.storage.pool())
            .await
            .expect("count")
    }
}

fn expect_error(rx: &mut mpsc::UnboundedReceiver<ServerFrame>, expected: &str) {
    match rx.try_recv().expect("error frame") {
        ServerFrame::Error { message } => assert_eq!(message, expected),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn message_reaches_live_recipient_and_confirms_sender() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;

    let (alice_handle, mut alice_rx) = harness.authed_connection(alice).await;
    let (_bob_handle, mut bob_rx) = harness.authed_connection(bob).await;

    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "hi".into(),
                temp_id: Some("t1".into()),
            },
        )
        .await;

    let delivered_id = match bob_rx.try_recv().expect("message frame") {
        ServerFrame::Message {
            id,
            sender_id,
            receiver_id,
            content,
            sender_username,
            ..
        } => {
            assert_eq!(sender_id, alice);
            assert_eq!(receiver_id, bob);
            assert_eq!(content, "hi");
            assert_eq!(sender_username.as_deref(), Some("alice"));
            id
        }
        other => panic!("unexpected frame: {other:?}"),
    };

    match alice_rx.try_recv().expect("confirmation frame") {
        ServerFrame::MessageConfirmed {
            temp_id,
            id,
            sender_id,
            receiver_id,
            content,
            ..
        } => {
            assert_eq!(temp_id.as_deref(), Some("t1"));
            assert_eq!(id, delivered_id);
            assert_eq!(sender_id, alice);
            assert_eq!(receiver_id, bob);
            assert_eq!(content, "hi");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    assert!(bob_rx.try_recv().is_err(), "exactly one frame per side");
    assert!(alice_rx.try_recv().is_err(), "exactly one frame per side");
    assert_eq!(harness.message_count().await, 1);
}

#[tokio::test]
async fn offline_recipient_still_gets_a_stored_row_and_sender_confirmation() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;

    let (alice_handle, mut alice_rx) = harness.authed_connection(alice).await;

    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "you there?".into(),
                temp_id: None,
            },
        )
        .await;

    match alice_rx.try_recv().expect("confirmation frame") {
        ServerFrame::MessageConfirmed {
            temp_id, content, ..
        } => {
            assert_eq!(temp_id, None);
            assert_eq!(content, "you there?");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert_eq!(harness.message_count().await, 1);
}

#[tokio::test]
async fn block_refuses_in_both_directions() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;

    // Bob blocked Alice; Alice cannot reach Bob...
    harness.storage.block_user(bob, alice).await.expect("block");

    let (alice_handle, mut alice_rx) = harness.authed_connection(alice).await;
    let (_bob_handle, mut bob_rx) = harness.authed_connection(bob).await;

    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "hi".into(),
                temp_id: None,
            },
        )
        .await;
    expect_error(&mut alice_rx, "Cannot send message to this user");
    assert!(bob_rx.try_recv().is_err());

    // ...and mutual silence means Bob cannot reach Alice either.
    let (bob_handle, mut bob_rx) = harness.authed_connection(bob).await;
    harness
        .router
        .handle_frame(
            &bob_handle,
            ClientFrame::Message {
                receiver_id: alice,
                content: "hi".into(),
                temp_id: None,
            },
        )
        .await;
    expect_error(&mut bob_rx, "Cannot send message to this user");

    assert_eq!(harness.message_count().await, 0);
}

#[tokio::test]
async fn unauthenticated_frames_are_rejected_without_closing() {
    let harness = setup().await;
    let bob = harness.seed_user("bob").await;
    let (handle, mut rx) = harness.connect();

    harness
        .router
        .handle_frame(
            &handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "hi".into(),
                temp_id: None,
            },
        )
        .await;
    expect_error(&mut rx, "Authentication required");

    harness
        .router
        .handle_frame(
            &handle,
            ClientFrame::Typing {
                receiver_id: bob,
                is_typing: true,
            },
        )
        .await;
    expect_error(&mut rx, "Authentication required");

    assert_eq!(harness.message_count().await, 0);
}

#[tokio::test]
async fn empty_content_is_refused_without_a_stored_row() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;
    let (alice_handle, mut alice_rx) = harness.authed_connection(alice).await;

    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "   ".into(),
                temp_id: None,
            },
        )
        .await;

    expect_error(&mut alice_rx, "Message content cannot be empty");
    assert_eq!(harness.message_count().await, 0);
}

#[tokio::test]
async fn typing_forwards_to_live_recipient_only() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;
    let carol = harness.seed_user("carol").await;

    let (alice_handle, mut alice_rx) = harness.authed_connection(alice).await;
    let (_bob_handle, mut bob_rx) = harness.authed_connection(bob).await;

    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Typing {
                receiver_id: bob,
                is_typing: true,
            },
        )
        .await;
    match bob_rx.try_recv().expect("typing frame") {
        ServerFrame::Typing {
            sender_id,
            is_typing,
        } => {
            assert_eq!(sender_id, alice);
            assert!(is_typing);
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // Carol is offline: the event is dropped with no error back to Alice.
    harness
        .router
        .handle_frame(
            &alice_handle,
            ClientFrame::Typing {
                receiver_id: carol,
                is_typing: true,
            },
        )
        .await;
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn auth_marks_user_online_and_close_marks_offline() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;

    let (handle, _rx) = harness.authed_connection(alice).await;
    assert_eq!(harness.status_of(alice).await, UserStatus::Online);

    harness.router.connection_closed(handle.conn_id()).await;
    assert_eq!(harness.status_of(alice).await, UserStatus::Offline);
    assert_eq!(harness.registry.resolve_sender(handle.conn_id()), None);
}

#[tokio::test]
async fn superseded_connection_closing_late_keeps_user_online() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;

    let (stale_handle, mut stale_rx) = harness.authed_connection(alice).await;
    let (_fresh_handle, mut fresh_rx) = harness.authed_connection(alice).await;

    // The zombie connection finally closes; the fresh session must survive.
    harness
        .router
        .connection_closed(stale_handle.conn_id())
        .await;
    assert_eq!(harness.status_of(alice).await, UserStatus::Online);

    let (bob_handle, _bob_rx) = harness.authed_connection(bob).await;
    harness
        .router
        .handle_frame(
            &bob_handle,
            ClientFrame::Message {
                receiver_id: alice,
                content: "still there?".into(),
                temp_id: None,
            },
        )
        .await;

    assert!(matches!(
        fresh_rx.try_recv(),
        Ok(ServerFrame::Message { .. })
    ));
    assert!(stale_rx.try_recv().is_err());
}

#[tokio::test]
async fn stale_handle_loses_sending_rights_after_supersede() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;

    let (stale_handle, mut stale_rx) = harness.authed_connection(alice).await;
    let (_fresh_handle, _fresh_rx) = harness.authed_connection(alice).await;

    harness
        .router
        .handle_frame(
            &stale_handle,
            ClientFrame::Message {
                receiver_id: bob,
                content: "hi".into(),
                temp_id: None,
            },
        )
        .await;

    expect_error(&mut stale_rx, "Authentication required");
    assert_eq!(harness.message_count().await, 0);
}

#[tokio::test]
async fn malformed_text_earns_an_error_frame() {
    let harness = setup().await;
    let (handle, mut rx) = harness.connect();

    harness.router.handle_text(&handle, "not json").await;
    expect_error(&mut rx, "Malformed frame");

    harness
        .router
        .handle_text(&handle, r#"{"type":"message"}"#)
        .await;
    expect_error(&mut rx, "Malformed frame");
}

#[tokio::test]
async fn frames_parsed_from_wire_text_deliver_end_to_end() {
    let harness = setup().await;
    let alice = harness.seed_user("alice").await;
    let bob = harness.seed_user("bob").await;
    assert_eq!(alice, UserId(1));
    assert_eq!(bob, UserId(2));

    let (alice_handle, mut alice_rx) = harness.connect();
    let (bob_handle, mut bob_rx) = harness.connect();

    harness
        .router
        .handle_text(&alice_handle, r#"{"type":"auth","userId":1}"#)
        .await;
    // String-encoded ids normalize to the same registry key.
    harness
        .router
        .handle_text(&bob_handle, r#"{"type":"auth","userId":"2"}"#)
        .await;
    harness
        .router
        .handle_text(
            &alice_handle,
            r#"{"type":"message","receiverId":"2","content":"hi","tempId":"t9"}"#,
        )
        .await;

    assert!(matches!(
        bob_rx.try_recv(),
        Ok(ServerFrame::Message { .. })
    ));
    match alice_rx.try_recv().expect("confirmation") {
        ServerFrame::MessageConfirmed { temp_id, .. } => {
            assert_eq!(temp_id.as_deref(), Some("t9"))
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn never_authenticated_close_is_a_noop() {
    let harness = setup().await;
    let (handle, _rx) = harness.connect();
    harness.router.connection_closed(handle.conn_id()).await;
}
