//! Bounded per-connection signal queue
//!
//! Each feed connection gets its own queue so one slow consumer can never
//! stall the others. The queue holds the newest signals: pushing into a
//! full queue evicts the oldest entry rather than blocking the publisher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::common::types::Signal;

/// Unique id for one feed connection, monotonically assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest entry was evicted to make room.
    DroppedOldest,
    /// The receiver is gone.
    Closed,
}

struct QueueState {
    queue: VecDeque<Arc<Signal>>,
    closed: bool,
}

struct QueueInner {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Publisher end, held by the broadcaster
pub struct SignalSender {
    inner: Arc<QueueInner>,
}

/// Consumer end, held by the connection's writer task
pub struct SignalReceiver {
    inner: Arc<QueueInner>,
}

/// Create a connected queue pair with the given capacity.
pub fn signal_queue(capacity: usize) -> (SignalSender, SignalReceiver) {
    let inner = Arc::new(QueueInner {
        capacity: capacity.max(1),
        state: Mutex::new(QueueState {
            queue: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        SignalSender {
            inner: inner.clone(),
        },
        SignalReceiver { inner },
    )
}

impl SignalSender {
    /// Push without blocking, evicting the oldest entry when full.
    pub fn push(&self, signal: Arc<Signal>) -> PushOutcome {
        let outcome = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.queue.len() == self.inner.capacity {
                state.queue.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.queue.push_back(signal);
            outcome
        };
        self.inner.notify.notify_one();
        outcome
    }

    /// Wake the receiver with end-of-stream. Queued signals are discarded.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.closed = true;
            state.queue.clear();
        }
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("queue lock poisoned").closed
    }
}

impl Drop for SignalReceiver {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        state.closed = true;
        state.queue.clear();
    }
}

impl SignalReceiver {
    /// Wait for the next signal; `None` once the sender closed the queue.
    pub async fn recv(&mut self) -> Option<Arc<Signal>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(signal) = state.queue.pop_front() {
                    return Some(signal);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop, mainly for tests
    pub fn try_recv(&mut self) -> Option<Arc<Signal>> {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .queue
            .pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Exchange, SignalType};
    use chrono::Utc;

    fn signal(price: f64) -> Arc<Signal> {
        Arc::new(Signal {
            user_id: "u1".to_string(),
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            signal_type: SignalType::Buy,
            ema_fast: 0.0,
            ema_slow: 0.0,
            price,
            detected_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let (tx, mut rx) = signal_queue(4);
        tx.push(signal(1.0));
        tx.push(signal(2.0));

        assert_eq!(rx.recv().await.unwrap().price, 1.0);
        assert_eq!(rx.recv().await.unwrap().price, 2.0);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        let (tx, mut rx) = signal_queue(2);
        assert_eq!(tx.push(signal(1.0)), PushOutcome::Queued);
        assert_eq!(tx.push(signal(2.0)), PushOutcome::Queued);
        assert_eq!(tx.push(signal(3.0)), PushOutcome::DroppedOldest);

        // Oldest is gone; the newest two remain in order.
        assert_eq!(rx.recv().await.unwrap().price, 2.0);
        assert_eq!(rx.recv().await.unwrap().price, 3.0);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (tx, mut rx) = signal_queue(2);
        tx.push(signal(1.0));
        tx.close();

        assert!(rx.recv().await.is_none());
        assert_eq!(tx.push(signal(2.0)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (tx, mut rx) = signal_queue(2);
        let waiter = tokio::spawn(async move { rx.recv().await });

        tokio::task::yield_now().await;
        tx.push(signal(7.0));

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.price, 7.0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_sender() {
        let (tx, rx) = signal_queue(2);
        drop(rx);
        assert_eq!(tx.push(signal(1.0)), PushOutcome::Closed);
    }
}
