//! Signal fan-out to feed connections
//!
//! The broadcaster owns the registry of live connections and copies each
//! published signal into every matching per-connection queue. Publishing
//! never blocks: a full queue drops its oldest entry and counts a degraded
//! delivery, and a connection that is full for too many consecutive
//! publishes is force-closed as unrecoverably slow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::common::types::Signal;
use crate::config::types::BroadcastConfig;

pub mod connection;

pub use connection::{ConnectionId, PushOutcome, SignalReceiver, SignalSender};

struct ConnectionEntry {
    /// Connections bound to a user only see that user's signals;
    /// unbound (observer) connections see everything.
    user_id: Option<String>,
    sender: SignalSender,
    /// Consecutive publishes that found the queue full
    full_streak: u32,
}

/// Aggregate delivery counters, readable at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastStats {
    pub connections: usize,
    pub degraded_deliveries: u64,
    pub forced_disconnects: u64,
}

/// Fan-out hub between the signal pipeline and the feed server
pub struct Broadcaster {
    config: BroadcastConfig,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    degraded_deliveries: AtomicU64,
    forced_disconnects: AtomicU64,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            degraded_deliveries: AtomicU64::new(0),
            forced_disconnects: AtomicU64::new(0),
        }
    }

    /// Register a connection; `user_id` scopes which signals it receives.
    pub fn register(&self, user_id: Option<String>) -> (ConnectionId, SignalReceiver) {
        let id = ConnectionId::next();
        let (sender, receiver) = connection::signal_queue(self.config.queue_capacity);

        let mut connections = self.connections.lock().expect("broadcaster lock poisoned");
        connections.insert(
            id,
            ConnectionEntry {
                user_id: user_id.clone(),
                sender,
                full_streak: 0,
            },
        );
        info!(connection = %id, user_id = ?user_id, total = connections.len(), "feed connection registered");
        (id, receiver)
    }

    /// Drop a connection from the registry, closing its queue.
    pub fn unregister(&self, id: ConnectionId) {
        let mut connections = self.connections.lock().expect("broadcaster lock poisoned");
        if let Some(entry) = connections.remove(&id) {
            entry.sender.close();
            info!(connection = %id, total = connections.len(), "feed connection unregistered");
        }
    }

    /// Copy one signal into every matching connection queue.
    ///
    /// Returns the number of queues the signal reached (degraded deliveries
    /// included).
    pub fn publish(&self, signal: &Signal) -> usize {
        let signal = Arc::new(signal.clone());
        let mut delivered = 0;
        let mut to_disconnect = Vec::new();

        {
            let mut connections = self.connections.lock().expect("broadcaster lock poisoned");
            for (id, entry) in connections.iter_mut() {
                if let Some(user_id) = &entry.user_id {
                    if *user_id != signal.user_id {
                        continue;
                    }
                }

                match entry.sender.push(signal.clone()) {
                    PushOutcome::Queued => {
                        entry.full_streak = 0;
                        delivered += 1;
                    }
                    PushOutcome::DroppedOldest => {
                        entry.full_streak += 1;
                        delivered += 1;
                        self.degraded_deliveries.fetch_add(1, Ordering::Relaxed);
                        debug!(connection = %id, streak = entry.full_streak, "slow consumer dropped a signal");
                        if entry.full_streak >= self.config.degraded_threshold {
                            to_disconnect.push(*id);
                        }
                    }
                    PushOutcome::Closed => to_disconnect.push(*id),
                }
            }

            for id in &to_disconnect {
                if let Some(entry) = connections.remove(id) {
                    entry.sender.close();
                    self.forced_disconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(connection = %id, "disconnecting unrecoverably slow consumer");
                }
            }
        }

        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            connections: self.connections.lock().expect("broadcaster lock poisoned").len(),
            degraded_deliveries: self.degraded_deliveries.load(Ordering::Relaxed),
            forced_disconnects: self.forced_disconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Exchange, SignalType};
    use chrono::Utc;

    fn signal_for(user: &str, price: f64) -> Signal {
        Signal {
            user_id: user.to_string(),
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            signal_type: SignalType::Buy,
            ema_fast: 0.0,
            ema_slow: 0.0,
            price,
            detected_at: Utc::now(),
        }
    }

    fn broadcaster(capacity: usize, threshold: u32) -> Broadcaster {
        Broadcaster::new(BroadcastConfig {
            queue_capacity: capacity,
            degraded_threshold: threshold,
            ..BroadcastConfig::default()
        })
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_matching_connections() {
        let hub = broadcaster(8, 3);
        let (_id1, mut rx1) = hub.register(None);
        let (_id2, mut rx2) = hub.register(Some("alice".to_string()));
        let (_id3, mut rx3) = hub.register(Some("bob".to_string()));

        let delivered = hub.publish(&signal_for("alice", 1.0));
        assert_eq!(delivered, 2);

        // Observer and alice get it, bob does not.
        assert_eq!(rx1.recv().await.unwrap().price, 1.0);
        assert_eq!(rx2.recv().await.unwrap().price, 1.0);
        assert!(rx3.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_per_connection_order_preserved() {
        let hub = broadcaster(8, 3);
        let (_id, mut rx) = hub.register(None);

        for i in 0..5 {
            hub.publish(&signal_for("u", f64::from(i)));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().price, f64::from(i));
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_degrades_then_disconnects() {
        let hub = broadcaster(2, 3);
        let (_id, mut rx) = hub.register(None);

        // Fill the queue, then three consecutive overflowing publishes.
        hub.publish(&signal_for("u", 0.0));
        hub.publish(&signal_for("u", 1.0));
        for i in 2..5 {
            hub.publish(&signal_for("u", f64::from(i)));
        }

        let stats = hub.stats();
        assert_eq!(stats.degraded_deliveries, 3);
        assert_eq!(stats.forced_disconnects, 1);
        assert_eq!(stats.connections, 0);

        // The close discards the backlog and ends the stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_streak_resets_after_successful_delivery() {
        let hub = broadcaster(2, 3);
        let (_id, mut rx) = hub.register(None);

        hub.publish(&signal_for("u", 0.0));
        hub.publish(&signal_for("u", 1.0));
        // Two overflows, not enough to disconnect.
        hub.publish(&signal_for("u", 2.0));
        hub.publish(&signal_for("u", 3.0));

        // Consumer catches up, streak resets.
        assert!(rx.recv().await.is_some());
        hub.publish(&signal_for("u", 4.0));

        // Two more overflows still stay under the threshold.
        hub.publish(&signal_for("u", 5.0));
        hub.publish(&signal_for("u", 6.0));
        assert_eq!(hub.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = broadcaster(2, 3);
        let (id, _rx) = hub.register(None);

        hub.unregister(id);
        hub.unregister(id);
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_connections_is_a_noop() {
        let hub = broadcaster(2, 3);
        assert_eq!(hub.publish(&signal_for("u", 1.0)), 0);
    }
}
