//! Outbound request pacing per exchange + credential pair

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::common::types::Exchange;

/// Enforces a minimum spacing between outbound calls to the same
/// exchange+credential pair regardless of which worker is calling.
///
/// Each `acquire` reserves the next free send slot under the map lock and
/// then sleeps outside it, so concurrent callers queue up in FIFO slots
/// 100ms apart instead of stampeding the exchange.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<PacerKey, Instant>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PacerKey {
    exchange: Exchange,
    api_key: String,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until this caller's reserved slot arrives.
    pub async fn acquire(&self, exchange: Exchange, api_key: &str) {
        let slot = {
            let mut slots = self.next_slot.lock().expect("pacer lock poisoned");
            let key = PacerKey {
                exchange,
                api_key: api_key.to_string(),
            };
            let now = Instant::now();
            let slot = match slots.get(&key) {
                Some(reserved) if *reserved > now => *reserved,
                _ => now,
            };
            slots.insert(key, slot + self.min_interval);
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_spacing_enforced_per_key() {
        let pacer = RequestPacer::new(Duration::from_millis(100));

        let start = Instant::now();
        pacer.acquire(Exchange::Binance, "k1").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        pacer.acquire(Exchange::Binance, "k1").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_credentials_do_not_queue() {
        let pacer = RequestPacer::new(Duration::from_millis(100));

        let start = Instant::now();
        pacer.acquire(Exchange::Binance, "k1").await;
        pacer.acquire(Exchange::Binance, "k2").await;
        pacer.acquire(Exchange::Bybit, "k1").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_sequential_slots() {
        let pacer = Arc::new(RequestPacer::new(Duration::from_millis(100)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pacer = pacer.clone();
            handles.push(tokio::spawn(async move {
                pacer.acquire(Exchange::Okx, "shared").await;
                start.elapsed()
            }));
        }

        let mut elapsed: Vec<Duration> = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap());
        }
        elapsed.sort();

        // Four callers spread over at least 300ms of slots.
        assert!(elapsed[3] >= Duration::from_millis(300));
    }
}
