// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket integration tests for the chat session handler.
//!
//! These tests spin up a real TCP listener, connect via WebSocket, and
//! exercise the full session flow end-to-end. Each test binds to port 0
//! for isolation.

mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use parley::messages::MessageStore;
use parley::users::UserDirectory;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// Tests: Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_returns_ack_and_snapshot() {
    let server = start_test_server().await;
    let mut ws = server.open_socket().await;

    let token = server.token_for("alice", "Alice");
    send(
        &mut ws,
        &make_envelope(json!({"type": "Connect", "token": token})),
    )
    .await;

    let ack = recv(&mut ws).await;
    assert_eq!(ack["payload"]["type"], "ConnectAck");
    assert_eq!(ack["payload"]["protocol_version"], 1);
    assert!(ack["payload"]["server_version"].is_string());

    // Snapshot includes the connecting user themselves
    let snapshot = recv(&mut ws).await;
    assert_eq!(snapshot["payload"]["type"], "OnlineUsers");
    let ids = snapshot["payload"]["user_ids"].as_array().unwrap();
    assert!(ids.iter().any(|id| id == "alice"));

    assert!(server.registry.is_online("alice"));
    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_handshake_invalid_token_rejected() {
    let server = start_test_server().await;
    let mut ws = server.open_socket().await;

    send(
        &mut ws,
        &make_envelope(json!({"type": "Connect", "token": "not.a.token"})),
    )
    .await;

    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["type"], "Error");
    assert_eq!(err["payload"]["code"], "auth-failed");

    // Nothing was registered
    assert_eq!(server.registry.online_count(), 0);
}

#[tokio::test]
async fn test_first_frame_must_be_connect() {
    let server = start_test_server().await;
    let mut ws = server.open_socket().await;

    send(
        &mut ws,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "hi"
        })),
    )
    .await;

    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["type"], "Error");
    assert_eq!(err["payload"]["code"], "auth-failed");
    assert_eq!(server.registry.online_count(), 0);
}

#[tokio::test]
async fn test_unknown_subject_rejected() {
    let server = start_test_server().await;
    let mut ws = server.open_socket().await;

    // Correctly signed token, but no directory record for this subject
    let token = server.token_for("ghost", "Ghost");
    send(
        &mut ws,
        &make_envelope(json!({"type": "Connect", "token": token})),
    )
    .await;

    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["type"], "Error");
    assert_eq!(err["payload"]["code"], "subject-not-found");

    // Refused with no side effects
    assert_eq!(server.registry.online_count(), 0);
    assert!(server.users.get("ghost").is_none());
}

#[tokio::test]
async fn test_handshake_marks_directory_record_online() {
    let server = start_test_server().await;
    let ws = server.connect_user("alice", "Alice").await;

    let record = server.users.get("alice").expect("record seeded");
    assert_eq!(record.username, "Alice");
    assert!(record.online);

    drop(ws);
}

// ============================================================================
// Tests: Messaging
// ============================================================================

#[tokio::test]
async fn test_send_message_delivers_and_echoes() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let mut bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "hello bob"
        })),
    )
    .await;

    // Sender gets the echo with expanded sender info
    let echo = recv_until_type(&mut alice, "MessageSent").await;
    assert_eq!(echo["payload"]["content"], "hello bob");
    assert_eq!(echo["payload"]["sender"]["username"], "Alice");
    assert_eq!(echo["payload"]["recipient"]["id"], "bob");
    assert_eq!(echo["payload"]["read_by"].as_array().unwrap().len(), 0);

    // Recipient gets the live push
    let push = recv_until_type(&mut bob, "ReceiveMessage").await;
    assert_eq!(push["payload"]["content"], "hello bob");
    assert_eq!(push["payload"]["id"], echo["payload"]["id"]);

    // Exactly one message persisted
    assert_eq!(server.store.message_count(), 1);
}

#[tokio::test]
async fn test_send_to_offline_recipient_persists_only() {
    let server = start_test_server().await;
    server.seed_user("bob", "Bob");
    let mut alice = server.connect_user("alice", "Alice").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "see you later"
        })),
    )
    .await;

    let echo = recv_until_type(&mut alice, "MessageSent").await;
    assert_eq!(echo["payload"]["content"], "see you later");
    assert_eq!(server.store.message_count(), 1);
}

#[tokio::test]
async fn test_send_to_unknown_recipient_is_scoped_error() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "nobody",
            "content": "hi"
        })),
    )
    .await;

    let err = recv_until_type(&mut alice, "Error").await;
    assert_eq!(err["payload"]["code"], "recipient-not-found");
    assert_eq!(server.store.message_count(), 0);

    // The session survives the error
    send(
        &mut alice,
        &make_envelope(json!({"type": "GetUserStatus", "user_id": "alice"})),
    )
    .await;
    let status = recv_until_type(&mut alice, "UserStatus").await;
    assert_eq!(status["payload"]["online"], true);
}

#[tokio::test]
async fn test_empty_content_rejected() {
    let server = start_test_server().await;
    server.seed_user("bob", "Bob");
    let mut alice = server.connect_user("alice", "Alice").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "   "
        })),
    )
    .await;

    let err = recv_until_type(&mut alice, "Error").await;
    assert_eq!(err["payload"]["code"], "empty-content");
    assert_eq!(server.store.message_count(), 0);
}

#[tokio::test]
async fn test_delete_message_notifies_recipient() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let mut bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "oops"
        })),
    )
    .await;
    let echo = recv_until_type(&mut alice, "MessageSent").await;
    let message_id = echo["payload"]["id"].as_str().unwrap().to_string();
    recv_until_type(&mut bob, "ReceiveMessage").await;

    send(
        &mut alice,
        &make_envelope(json!({"type": "DeleteMessage", "message_id": message_id})),
    )
    .await;

    let alice_note = recv_until_type(&mut alice, "MessageDeleted").await;
    assert_eq!(alice_note["payload"]["message_id"], message_id.as_str());
    let bob_note = recv_until_type(&mut bob, "MessageDeleted").await;
    assert_eq!(bob_note["payload"]["message_id"], message_id.as_str());

    let stored = server.store.get(&message_id).unwrap();
    assert!(stored.deleted);
}

#[tokio::test]
async fn test_delete_foreign_message_rejected() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let mut bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "mine"
        })),
    )
    .await;
    let echo = recv_until_type(&mut alice, "MessageSent").await;
    let message_id = echo["payload"]["id"].as_str().unwrap().to_string();
    recv_until_type(&mut bob, "ReceiveMessage").await;

    send(
        &mut bob,
        &make_envelope(json!({"type": "DeleteMessage", "message_id": message_id})),
    )
    .await;

    let err = recv_until_type(&mut bob, "Error").await;
    assert_eq!(err["payload"]["code"], "not-permitted");
    assert!(!server.store.get(&message_id).unwrap().deleted);
}

// ============================================================================
// Tests: Typing indicators and read receipts
// ============================================================================

#[tokio::test]
async fn test_typing_indicator_roundtrip() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let mut bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({"type": "Typing", "recipient_id": "bob"})),
    )
    .await;
    let typing = recv_until_type(&mut bob, "TypingIndicator").await;
    assert_eq!(typing["payload"]["sender_id"], "alice");
    assert_eq!(typing["payload"]["sender_name"], "Alice");

    send(
        &mut alice,
        &make_envelope(json!({"type": "StopTyping", "recipient_id": "bob"})),
    )
    .await;
    let stop = recv_until_type(&mut bob, "StopTypingIndicator").await;
    assert_eq!(stop["payload"]["sender_id"], "alice");

    // No durable state change
    assert_eq!(server.store.message_count(), 0);
}

#[tokio::test]
async fn test_mark_read_pushes_receipt_once() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let mut bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "read me"
        })),
    )
    .await;
    let echo = recv_until_type(&mut alice, "MessageSent").await;
    let message_id = echo["payload"]["id"].as_str().unwrap().to_string();
    recv_until_type(&mut bob, "ReceiveMessage").await;

    let mark = make_envelope(json!({
        "type": "MarkAsRead",
        "message_ids": [message_id],
        "sender_id": "alice"
    }));
    send(&mut bob, &mark).await;

    let receipt = recv_until_type(&mut alice, "MessagesRead").await;
    assert_eq!(receipt["payload"]["read_by"], "bob");
    assert_eq!(server.store.get(&message_id).unwrap().read_by, vec!["bob"]);

    // Marking again is a no-op with no second receipt
    send(&mut bob, &mark).await;
    assert!(try_recv(&mut alice).await.is_none());
    assert_eq!(server.store.get(&message_id).unwrap().read_by, vec!["bob"]);
}

// ============================================================================
// Tests: Presence
// ============================================================================

#[tokio::test]
async fn test_presence_broadcasts_on_connect_and_disconnect() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;

    let mut bob = server.connect_user("bob", "Bob").await;
    let online = recv_until_type(&mut alice, "UserOnline").await;
    assert_eq!(online["payload"]["user_id"], "bob");

    bob.close(None).await.ok();
    let offline = recv_until_type(&mut alice, "UserOffline").await;
    assert_eq!(offline["payload"]["user_id"], "bob");

    // Durable record has the offline flag and a last_seen stamp
    let record = server.users.get("bob").unwrap();
    assert!(!record.online);
    assert!(record.last_seen_secs > 0);
}

#[tokio::test]
async fn test_presence_broadcasts_pair_on_abrupt_disconnect() {
    let server = start_test_server().await;
    server.seed_user("alice", "Alice");
    let mut bob = server.connect_user("bob", "Bob").await;

    // Alice authenticates and vanishes without reading a single reply.
    // Observers must still see her online broadcast before the offline one.
    let mut alice = server.open_socket().await;
    let token = server.token_for("alice", "Alice");
    send(
        &mut alice,
        &make_envelope(json!({"type": "Connect", "token": token})),
    )
    .await;
    drop(alice);

    let online = recv_until_type(&mut bob, "UserOnline").await;
    assert_eq!(online["payload"]["user_id"], "alice");
    let offline = recv_until_type(&mut bob, "UserOffline").await;
    assert_eq!(offline["payload"]["user_id"], "alice");
}

#[tokio::test]
async fn test_get_user_status() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;
    let bob = server.connect_user("bob", "Bob").await;

    send(
        &mut alice,
        &make_envelope(json!({"type": "GetUserStatus", "user_id": "bob"})),
    )
    .await;
    let status = recv_until_type(&mut alice, "UserStatus").await;
    assert_eq!(status["payload"]["user_id"], "bob");
    assert_eq!(status["payload"]["online"], true);

    drop(bob);
    // Give the server a moment to tear the session down
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(
        &mut alice,
        &make_envelope(json!({"type": "GetUserStatus", "user_id": "bob"})),
    )
    .await;
    let status = recv_until_type(&mut alice, "UserStatus").await;
    assert_eq!(status["payload"]["online"], false);
}

#[tokio::test]
async fn test_reconnect_supersedes_without_offline_broadcast() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;

    let bob_old = server.connect_user("bob", "Bob").await;
    recv_until_type(&mut alice, "UserOnline").await;

    // Second connection for bob replaces the first
    let mut bob_new = server.connect_user("bob", "Bob").await;
    assert_eq!(server.registry.online_count(), 2);

    // The superseded socket winds down; give it a moment
    drop(bob_old);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Bob is still online through the new connection and no UserOffline
    // was broadcast for the superseded session
    assert!(server.registry.is_online("bob"));
    loop {
        match try_recv(&mut alice).await {
            Some(env) => assert_ne!(env["payload"]["type"], "UserOffline"),
            None => break,
        }
    }

    // Messages flow to the new connection
    send(
        &mut alice,
        &make_envelope(json!({
            "type": "SendMessage",
            "recipient_id": "bob",
            "content": "still there?"
        })),
    )
    .await;
    let push = recv_until_type(&mut bob_new, "ReceiveMessage").await;
    assert_eq!(push["payload"]["content"], "still there?");
}

// ============================================================================
// Tests: Robustness
// ============================================================================

#[tokio::test]
async fn test_rate_limit_sends_scoped_error() {
    let server = start_test_server_with_limit(3).await;
    let mut alice = server.connect_user("alice", "Alice").await;

    for _ in 0..5 {
        send(
            &mut alice,
            &make_envelope(json!({"type": "GetUserStatus", "user_id": "alice"})),
        )
        .await;
    }

    let err = recv_until_type(&mut alice, "Error").await;
    assert_eq!(err["payload"]["code"], "rate-limited");

    // Still connected
    assert!(server.registry.is_online("alice"));
}

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;

    send(
        &mut alice,
        &make_envelope(json!({"type": "FutureFeature", "data": 42})),
    )
    .await;

    // Session stays up and keeps responding
    send(
        &mut alice,
        &make_envelope(json!({"type": "GetUserStatus", "user_id": "alice"})),
    )
    .await;
    let status = recv_until_type(&mut alice, "UserStatus").await;
    assert_eq!(status["payload"]["online"], true);
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let server = start_test_server().await;
    let mut alice = server.connect_user("alice", "Alice").await;

    alice.send(Message::Ping(vec![1, 2, 3])).await.unwrap();
    let msg = timeout(Duration::from_secs(3), alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Pong(vec![1, 2, 3]));
}
