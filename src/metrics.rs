//! Prometheus Metrics
//!
//! Observability counters for the chat server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Chat server metrics.
#[derive(Clone)]
pub struct ChatMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (socket or protocol handshake failures).
    pub connection_errors: IntCounter,
    /// Sessions refused during identity verification.
    pub auth_failures: IntCounter,

    // Event metrics
    /// Total inbound events received after the handshake.
    pub events_received: IntCounter,
    /// Events rejected (rate limited, too large, malformed).
    pub events_rejected: IntCounter,
    /// Event processing duration in seconds.
    pub event_duration: Histogram,

    // Relay metrics
    /// Messages accepted and persisted.
    pub messages_relayed: IntCounter,
    /// Messages pushed to a live recipient connection.
    pub messages_delivered_live: IntCounter,
    /// Read receipts fanned out to senders.
    pub read_receipts: IntCounter,
    /// Presence changes broadcast to other connections.
    pub presence_broadcasts: IntCounter,

    // Rate limiting
    /// Events rate limited.
    pub rate_limited: IntCounter,
}

impl ChatMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "chat_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "chat_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "chat_connection_errors_total",
            "Total connection errors",
        ))
        .unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "chat_auth_failures_total",
            "Sessions refused during identity verification",
        ))
        .unwrap();

        let events_received = IntCounter::with_opts(Opts::new(
            "chat_events_received_total",
            "Total inbound events received",
        ))
        .unwrap();

        let events_rejected = IntCounter::with_opts(Opts::new(
            "chat_events_rejected_total",
            "Total inbound events rejected",
        ))
        .unwrap();

        let event_duration = Histogram::with_opts(HistogramOpts::new(
            "chat_event_duration_seconds",
            "Event processing duration in seconds",
        ))
        .unwrap();

        let messages_relayed = IntCounter::with_opts(Opts::new(
            "chat_messages_relayed_total",
            "Messages accepted and persisted",
        ))
        .unwrap();

        let messages_delivered_live = IntCounter::with_opts(Opts::new(
            "chat_messages_delivered_live_total",
            "Messages pushed to a live recipient connection",
        ))
        .unwrap();

        let read_receipts = IntCounter::with_opts(Opts::new(
            "chat_read_receipts_total",
            "Read receipts fanned out to senders",
        ))
        .unwrap();

        let presence_broadcasts = IntCounter::with_opts(Opts::new(
            "chat_presence_broadcasts_total",
            "Presence changes broadcast to other connections",
        ))
        .unwrap();

        let rate_limited = IntCounter::with_opts(Opts::new(
            "chat_rate_limited_total",
            "Total events rate limited",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry.register(Box::new(auth_failures.clone())).unwrap();
        registry
            .register(Box::new(events_received.clone()))
            .unwrap();
        registry
            .register(Box::new(events_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(event_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_relayed.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_delivered_live.clone()))
            .unwrap();
        registry.register(Box::new(read_receipts.clone())).unwrap();
        registry
            .register(Box::new(presence_broadcasts.clone()))
            .unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        ChatMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            auth_failures,
            events_received,
            events_rejected,
            event_duration,
            messages_relayed,
            messages_delivered_live,
            read_receipts,
            presence_broadcasts,
            rate_limited,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for ChatMetrics {
    fn default() -> Self {
        Self::new()
    }
}
