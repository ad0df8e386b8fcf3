// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for chat server integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use parley::auth::TokenVerifier;
use parley::fanout::SignalFanout;
use parley::handler::{self, ConnectionDeps};
use parley::messages::{MemoryMessageStore, MessageStore};
use parley::metrics::ChatMetrics;
use parley::presence::PresenceRegistry;
use parley::rate_limit::RateLimiter;
use parley::relay::MessageRelay;
use parley::users::{MemoryUserDirectory, UserDirectory, UserRecord};

pub const TEST_SECRET: &str = "test-secret";
pub const FRAME_HEADER_SIZE: usize = 4;

pub type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Encodes a JSON value into a binary frame (4-byte BE length prefix + JSON).
pub fn encode_envelope(envelope: &Value) -> Vec<u8> {
    let json = serde_json::to_vec(envelope).unwrap();
    let len = json.len() as u32;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    frame
}

/// Decodes a binary frame back to a JSON value.
pub fn decode_envelope(data: &[u8]) -> Value {
    assert!(data.len() >= FRAME_HEADER_SIZE, "Frame too short");
    let json = &data[FRAME_HEADER_SIZE..];
    serde_json::from_slice(json).unwrap()
}

/// Wraps an event payload in a wire envelope.
pub fn make_envelope(payload: Value) -> Value {
    json!({
        "version": 1,
        "message_id": uuid::Uuid::new_v4().to_string(),
        "timestamp": 1000,
        "payload": payload
    })
}

/// A chat server running on an ephemeral port, accepting any number of
/// connections. Holds the shared state so tests can inspect it directly.
pub struct TestServer {
    pub url: String,
    pub users: Arc<MemoryUserDirectory>,
    pub store: Arc<MemoryMessageStore>,
    pub registry: Arc<PresenceRegistry>,
    pub verifier: Arc<TokenVerifier>,
}

/// Starts a test server with the given per-user rate limit.
pub async fn start_test_server_with_limit(rate_limit: u32) -> TestServer {
    let users = Arc::new(MemoryUserDirectory::new());
    let store = Arc::new(MemoryMessageStore::new());
    let registry = Arc::new(PresenceRegistry::new());
    let verifier = Arc::new(TokenVerifier::new(TEST_SECRET));

    let relay = Arc::new(MessageRelay::new(
        registry.clone(),
        users.clone() as Arc<dyn UserDirectory>,
        store.clone() as Arc<dyn MessageStore>,
    ));
    let fanout = Arc::new(SignalFanout::new(
        registry.clone(),
        store.clone() as Arc<dyn MessageStore>,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(rate_limit));
    let metrics = ChatMetrics::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let server = TestServer {
        url,
        users: users.clone(),
        store: store.clone(),
        registry: registry.clone(),
        verifier: verifier.clone(),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let deps = ConnectionDeps {
                verifier: verifier.clone(),
                users: users.clone() as Arc<dyn UserDirectory>,
                registry: registry.clone(),
                relay: relay.clone(),
                fanout: fanout.clone(),
                rate_limiter: rate_limiter.clone(),
                metrics: metrics.clone(),
                max_message_size: 1_048_576,
                idle_timeout: Duration::from_secs(5),
            };
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    handler::handle_connection(ws, deps).await;
                }
            });
        }
    });

    server
}

/// Starts a test server with a generous rate limit.
pub async fn start_test_server() -> TestServer {
    start_test_server_with_limit(600).await
}

impl TestServer {
    /// Seeds a user record in the directory.
    pub fn seed_user(&self, id: &str, username: &str) {
        self.users
            .insert(UserRecord::new(id, username, format!("{id}@example.com")));
    }

    /// Issues a valid token for a user.
    pub fn token_for(&self, user_id: &str, username: &str) -> String {
        self.verifier.issue(user_id, username).unwrap()
    }

    /// Opens a socket without performing the handshake.
    pub async fn open_socket(&self) -> Ws {
        let (ws, _) = connect_async(&self.url).await.unwrap();
        ws
    }

    /// Connects and authenticates a user, consuming the ConnectAck and the
    /// presence snapshot. Seeds the directory record if the user is new.
    /// Returns the socket ready for events.
    pub async fn connect_user(&self, user_id: &str, username: &str) -> Ws {
        if self.users.get(user_id).is_none() {
            self.seed_user(user_id, username);
        }
        let mut ws = self.open_socket().await;
        let token = self.token_for(user_id, username);
        send(
            &mut ws,
            &make_envelope(json!({"type": "Connect", "token": token})),
        )
        .await;

        let ack = recv(&mut ws).await;
        assert_eq!(ack["payload"]["type"], "ConnectAck", "got {ack}");
        let snapshot = recv(&mut ws).await;
        assert_eq!(snapshot["payload"]["type"], "OnlineUsers", "got {snapshot}");

        ws
    }
}

/// Sends a binary frame.
pub async fn send(ws: &mut Ws, msg: &Value) {
    ws.send(Message::Binary(encode_envelope(msg)))
        .await
        .unwrap();
}

/// Receives the next binary message as JSON.
pub async fn recv(ws: &mut Ws) -> Value {
    let msg = timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Binary(data) => decode_envelope(&data),
        other => panic!("Expected Binary message, got {:?}", other),
    }
}

/// Receives frames until one matches the given payload type. Presence
/// broadcasts from other sessions interleave with direct replies, so most
/// assertions want this instead of `recv`.
pub async fn recv_until_type(ws: &mut Ws, payload_type: &str) -> Value {
    for _ in 0..10 {
        let env = recv(ws).await;
        if env["payload"]["type"] == payload_type {
            return env;
        }
    }
    panic!("No {payload_type} frame within 10 messages");
}

/// Tries to receive a message with a short timeout. Returns None if nothing
/// arrives.
pub async fn try_recv(ws: &mut Ws) -> Option<Value> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => Some(decode_envelope(&data)),
        _ => None,
    }
}
