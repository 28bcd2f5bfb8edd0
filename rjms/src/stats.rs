//! Engine statistics
//!
//! Every aggregate bumps its own gauge here so that a running broker can be
//! inspected without walking its caches:
//!
//! ```text
//! Stats
//!   destinations          registered destinations
//!   caches                instantiated destination caches
//!   consumers             open consumer endpoints (durable ones included)
//!   durable_subscriptions durable subscriptions, active or not
//!   browsers              open queue browsers
//!   handles               live message handles
//!   leases                pending expiry leases
//!   messages_received     messages accepted by the message manager
//!   messages_persistent   accepted messages with persistent delivery
//!   messages_cached       persistent messages held in memory
//!   messages_dropped      topic messages nobody subscribed to
//!   messages_expired      messages removed by lease expiry
//!   messages_destroyed    messages whose last reference went away
//! ```

use serde_json::json;

use rjms_utils::Counter;

#[derive(Debug, Default)]
pub struct Stats {
    pub destinations: Counter,
    pub caches: Counter,
    pub consumers: Counter,
    pub durable_subscriptions: Counter,
    pub browsers: Counter,
    pub handles: Counter,
    pub leases: Counter,
    pub messages_received: Counter,
    pub messages_persistent: Counter,
    pub messages_cached: Counter,
    pub messages_dropped: Counter,
    pub messages_expired: Counter,
    pub messages_destroyed: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "destinations.count": self.destinations.count(),
            "destinations.max": self.destinations.max(),
            "caches.count": self.caches.count(),
            "caches.max": self.caches.max(),
            "consumers.count": self.consumers.count(),
            "consumers.max": self.consumers.max(),
            "durable_subscriptions.count": self.durable_subscriptions.count(),
            "durable_subscriptions.max": self.durable_subscriptions.max(),
            "browsers.count": self.browsers.count(),
            "browsers.max": self.browsers.max(),
            "handles.count": self.handles.count(),
            "handles.max": self.handles.max(),
            "leases.count": self.leases.count(),
            "leases.max": self.leases.max(),
            "messages.received": self.messages_received.count(),
            "messages.persistent": self.messages_persistent.count(),
            "messages.cached.count": self.messages_cached.count(),
            "messages.cached.max": self.messages_cached.max(),
            "messages.dropped": self.messages_dropped.count(),
            "messages.expired": self.messages_expired.count(),
            "messages.destroyed": self.messages_destroyed.count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Stats;

    #[test]
    fn test_to_json() {
        let stats = Stats::new();
        stats.consumers.incs(3);
        stats.consumers.dec();
        stats.messages_dropped.inc();
        let json = stats.to_json();
        assert_eq!(json["consumers.count"], 2);
        assert_eq!(json["consumers.max"], 3);
        assert_eq!(json["messages.dropped"], 1);
    }
}
