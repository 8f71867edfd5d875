//! Broker counters and the read-only statistics snapshot.
//!
//! Gauges (`connections`, `out_inflights`, ...) move up and down and remember their peak.
//! Message counters only ever grow. Session, route and retained counts are owned by
//! their stores and are read when the snapshot is taken.

use serde_json::json;

use crate::context::ServerContext;
use crate::utils::Counter;

#[derive(Debug, Default)]
pub struct Stats {
    pub handshakings: Counter,
    pub connections: Counter,
    pub out_inflights: Counter,
    pub in_inflights: Counter,

    pub messages_received: Counter,
    pub messages_delivered: Counter,
    pub messages_acked: Counter,
    pub messages_dropped: Counter,
    pub forwards: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self, scx: &ServerContext) -> serde_json::Value {
        json!({
            "node_id": scx.node_id(),
            "handshakings": self.handshakings.to_json(),
            "connections": self.connections.to_json(),
            "sessions": scx.sessions.count().to_json(),
            "topics": scx.router.topics().to_json(),
            "routes": scx.router.routes().to_json(),
            "retaineds": {
                "count": scx.retain.count(),
                "max": scx.retain.max(),
            },
            "out_inflights": self.out_inflights.to_json(),
            "in_inflights": self.in_inflights.to_json(),
            "messages": {
                "received": self.messages_received.count(),
                "delivered": self.messages_delivered.count(),
                "acked": self.messages_acked.count(),
                "dropped": self.messages_dropped.count(),
                "forwards": self.forwards.count(),
            },
            "persistence": {
                "backend": scx.storage.name(),
                "errors": scx.persister.errors(),
            },
        })
    }
}
