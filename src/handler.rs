// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Drives a single client session: handshake, event dispatch, teardown.
//!
//! The first frame on a connection must be `Connect` with a valid token;
//! nothing is registered before the identity checks out. After that the task
//! multiplexes client frames against the registry channel that other
//! sessions push delivery frames into. Teardown runs exactly once after the
//! loop exits, whatever made it exit.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::auth::{AuthError, TokenVerifier};
use crate::fanout::SignalFanout;
use crate::metrics::ChatMetrics;
use crate::presence::{ConnectionMeta, PresenceRegistry};
use crate::protocol::{
    self, ConnectAck, EventPayload, OnlineUsers, UserStatus, PROTOCOL_VERSION,
};
use crate::rate_limit::RateLimiter;
use crate::relay::MessageRelay;
use crate::users::UserDirectory;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Shared dependencies for handling a WebSocket connection.
pub struct ConnectionDeps {
    pub verifier: Arc<TokenVerifier>,
    pub users: Arc<dyn UserDirectory>,
    pub registry: Arc<PresenceRegistry>,
    pub relay: Arc<MessageRelay>,
    pub fanout: Arc<SignalFanout>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: ChatMetrics,
    pub max_message_size: usize,
    pub idle_timeout: Duration,
}

/// Sends an envelope on this session's write half. Returns false if the
/// socket is gone.
async fn send_envelope(write: &mut WsWriter, env: &protocol::Envelope, session: &str) -> bool {
    match protocol::encode_message(env) {
        Ok(data) => write.send(Message::Binary(data)).await.is_ok(),
        Err(e) => {
            warn!("[{}] Failed to encode outgoing frame: {}", session, e);
            true
        }
    }
}

async fn send_error(write: &mut WsWriter, session: &str, message: &str, code: Option<&str>) {
    let env = protocol::error_event(message, code);
    let _ = send_envelope(write, &env, session).await;
}

/// Handles a WebSocket connection.
#[allow(clippy::too_many_lines)]
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    let ConnectionDeps {
        verifier,
        users,
        registry,
        relay,
        fanout,
        rate_limiter,
        metrics,
        max_message_size,
        idle_timeout,
    } = deps;

    // Random session label for log correlation. User ids are fine to log
    // after the handshake, but the label survives auth failures too.
    let connection_id = uuid::Uuid::new_v4().to_string();
    let session = &connection_id[..8];

    let (mut write, mut read) = ws_stream.split();

    // First frame must be the Connect handshake
    let first_msg = match timeout(idle_timeout, read.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => data,
        Ok(Some(Ok(_))) => {
            warn!("[{}] Expected binary frame for handshake", session);
            metrics.auth_failures.inc();
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("[{}] Error reading handshake: {}", session, e);
            return;
        }
        Ok(None) => {
            debug!("[{}] Connection closed before handshake", session);
            return;
        }
        Err(_) => {
            warn!("[{}] Handshake timeout (slowloris protection)", session);
            return;
        }
    };

    let token = match protocol::decode_message(&first_msg) {
        Ok(envelope) => match envelope.payload {
            EventPayload::Connect(c) => c.token,
            other => {
                warn!("[{}] Expected Connect, got {:?}", session, other);
                metrics.auth_failures.inc();
                send_error(&mut write, session, "Handshake required", Some("auth-failed")).await;
                return;
            }
        },
        Err(e) => {
            warn!("[{}] Failed to decode handshake: {}", session, e);
            metrics.auth_failures.inc();
            return;
        }
    };

    let identity = match verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("[{}] Identity verification failed: {}", session, e);
            metrics.auth_failures.inc();
            send_error(&mut write, session, "Authentication failed", Some("auth-failed")).await;
            return;
        }
    };
    let user_id = identity.user_id.clone();

    // A valid signature is not enough; the subject must resolve in the
    // directory. Tokens outlive account deletion.
    if !users.exists(&user_id) {
        warn!("[{}] Token subject {} not in directory", session, user_id);
        metrics.auth_failures.inc();
        send_error(
            &mut write,
            session,
            &AuthError::SubjectNotFound.to_string(),
            Some("subject-not-found"),
        )
        .await;
        return;
    }

    debug!("[{}] User {} connected", session, user_id);

    // Register for delivery pushes, then flip the durable presence flag.
    // A newer connection for the same user silently supersedes this one;
    // our receiver closing is how we find out.
    let mut registry_rx = registry.register(ConnectionMeta {
        connection_id: connection_id.clone(),
        user_id: user_id.clone(),
        established_at_secs: protocol::now_secs(),
    });
    users.set_online(&user_id);

    // Broadcast before the ack sends; the offline broadcast in
    // finish_session always pairs with an online one
    fanout.broadcast_presence(&user_id, true);
    metrics.presence_broadcasts.inc();

    let ack = protocol::envelope(EventPayload::ConnectAck(ConnectAck {
        protocol_version: PROTOCOL_VERSION,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    }));
    if !send_envelope(&mut write, &ack, session).await {
        warn!("[{}] Failed to send ConnectAck", session);
        finish_session(&registry, &users, &fanout, &metrics, &user_id, &connection_id);
        return;
    }

    // Presence snapshot for the new arrival (includes the user themselves)
    let snapshot = protocol::envelope(EventPayload::OnlineUsers(OnlineUsers {
        user_ids: registry.snapshot(),
    }));
    if !send_envelope(&mut write, &snapshot, session).await {
        warn!("[{}] Failed to send presence snapshot", session);
        finish_session(&registry, &users, &fanout, &metrics, &user_id, &connection_id);
        return;
    }

    // Event loop: multiplex client frames against pushes from other sessions
    loop {
        let msg = tokio::select! {
            ws_msg = timeout(idle_timeout, read.next()) => {
                match ws_msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] Idle timeout (slowloris protection)", session);
                        break;
                    }
                }
            }
            registry_msg = registry_rx.recv() => {
                match registry_msg {
                    Some(frame) => {
                        let _ = write.send(Message::Binary(frame.data)).await;
                        continue;
                    }
                    None => {
                        // Superseded by a newer connection for this user
                        debug!("[{}] Session superseded", session);
                        break;
                    }
                }
            }
        };

        match msg {
            Ok(Message::Binary(data)) => {
                if data.len() > max_message_size {
                    warn!("[{}] Frame too large: {} bytes", session, data.len());
                    metrics.events_rejected.inc();
                    send_error(&mut write, session, "Frame too large", Some("too-large")).await;
                    continue;
                }

                if !rate_limiter.consume(&user_id) {
                    metrics.rate_limited.inc();
                    metrics.events_rejected.inc();
                    send_error(&mut write, session, "Rate limit exceeded", Some("rate-limited"))
                        .await;
                    continue;
                }

                let envelope = match protocol::decode_message(&data) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("[{}] Failed to decode frame: {}", session, e);
                        metrics.events_rejected.inc();
                        send_error(&mut write, session, "Malformed frame", Some("malformed")).await;
                        continue;
                    }
                };

                metrics.events_received.inc();
                let timer = metrics.event_duration.start_timer();

                match envelope.payload {
                    EventPayload::SendMessage(req) => match relay.send(&user_id, req) {
                        Ok(outcome) => {
                            metrics.messages_relayed.inc();
                            if outcome.delivered {
                                metrics.messages_delivered_live.inc();
                            }
                            let echo =
                                protocol::envelope(EventPayload::MessageSent(outcome.view));
                            let _ = send_envelope(&mut write, &echo, session).await;
                        }
                        Err(e) => {
                            debug!("[{}] Send rejected: {}", session, e);
                            metrics.events_rejected.inc();
                            send_error(&mut write, session, &e.to_string(), Some(e.code())).await;
                        }
                    },
                    EventPayload::DeleteMessage(req) => {
                        match relay.delete(&user_id, &req.message_id) {
                            Ok(()) => {
                                let echo = protocol::envelope(EventPayload::MessageDeleted(
                                    protocol::MessageDeleted {
                                        message_id: req.message_id,
                                    },
                                ));
                                let _ = send_envelope(&mut write, &echo, session).await;
                            }
                            Err(e) => {
                                debug!("[{}] Delete rejected: {}", session, e);
                                metrics.events_rejected.inc();
                                send_error(&mut write, session, &e.to_string(), Some(e.code()))
                                    .await;
                            }
                        }
                    }
                    EventPayload::Typing(t) => {
                        fanout.typing(&user_id, &identity.username, &t.recipient_id);
                    }
                    EventPayload::StopTyping(t) => {
                        fanout.stop_typing(&user_id, &t.recipient_id);
                    }
                    EventPayload::MarkAsRead(req) => {
                        fanout.mark_read(&user_id, &req.message_ids, &req.sender_id);
                        metrics.read_receipts.inc();
                    }
                    EventPayload::GetUserStatus(q) => {
                        let reply = protocol::envelope(EventPayload::UserStatus(UserStatus {
                            online: registry.is_online(&q.user_id),
                            user_id: q.user_id,
                        }));
                        let _ = send_envelope(&mut write, &reply, session).await;
                    }
                    EventPayload::Connect(_) => {
                        // Ignore duplicate handshakes
                    }
                    EventPayload::Unknown => {
                        debug!("[{}] Unknown event type", session);
                    }
                    other => {
                        // Server-to-client events echoed back by a confused client
                        debug!("[{}] Unexpected event: {:?}", session, other);
                    }
                }

                timer.observe_duration();
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                debug!("[{}] Client sent close", session);
                break;
            }
            Ok(_) => {
                // Ignore text, pong, etc.
            }
            Err(e) => {
                warn!("[{}] Connection error: {}", session, e);
                break;
            }
        }
    }

    finish_session(&registry, &users, &fanout, &metrics, &user_id, &connection_id);
    debug!("[{}] Session finished", session);
}

/// Tears a session down: registry entry first, then the durable offline
/// stamp, then the presence broadcast. A superseded session only releases
/// its own entry; the successor owns the user's presence now, so no
/// offline broadcast happens.
fn finish_session(
    registry: &PresenceRegistry,
    users: &Arc<dyn UserDirectory>,
    fanout: &SignalFanout,
    metrics: &ChatMetrics,
    user_id: &str,
    connection_id: &str,
) {
    if !registry.remove_if(user_id, connection_id) {
        return;
    }
    if !users.set_offline(user_id, protocol::now_secs()) {
        warn!("Failed to stamp last_seen for disconnecting user");
    }
    fanout.broadcast_presence(user_id, false);
    metrics.presence_broadcasts.inc();
}
