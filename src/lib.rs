// SPDX-License-Identifier: GPL-3.0-or-later

//! Parley chat server library.
//!
//! Real-time direct messaging over WebSocket: clients authenticate with a
//! bearer token in the opening frame, exchange text messages with live
//! delivery when the recipient is online, and receive typing indicators,
//! read receipts, and online/offline presence broadcasts. Messages are
//! durably appended before any live push, so a recipient who was offline
//! picks them up through the conversation query on reconnect.

pub mod auth;
pub mod config;
pub mod connection_limit;
pub mod fanout;
pub mod handler;
pub mod http;
pub mod messages;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod users;
