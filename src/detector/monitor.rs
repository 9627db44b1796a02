//! Registry of running detector workers

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::worker::DetectorWorker;
use super::{DetectorEvent, DetectorKey};
use crate::common::types::ExchangeCredential;
use crate::config::types::DetectorConfig;
use crate::exchange::ExchangeOps;

/// Owns one polling task per monitored stream.
///
/// Start/stop are idempotent: starting an already-monitored key is a no-op,
/// stopping an unknown key does nothing.
pub struct SignalMonitor {
    gateway: Arc<dyn ExchangeOps>,
    config: DetectorConfig,
    events: mpsc::Sender<DetectorEvent>,
    workers: std::sync::Mutex<HashMap<DetectorKey, JoinHandle<()>>>,
}

impl SignalMonitor {
    pub fn new(
        gateway: Arc<dyn ExchangeOps>,
        config: DetectorConfig,
        events: mpsc::Sender<DetectorEvent>,
    ) -> Self {
        Self {
            gateway,
            config,
            events,
            workers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a worker for `key` unless one is already running.
    /// Returns whether a new worker was started.
    pub fn start(&self, key: DetectorKey, cred: ExchangeCredential) -> bool {
        let mut workers = self.workers.lock().expect("monitor lock poisoned");
        if let Some(handle) = workers.get(&key) {
            if !handle.is_finished() {
                return false;
            }
        }

        info!(key = %key, "starting detector worker");
        let worker = DetectorWorker::new(
            key.clone(),
            cred,
            self.gateway.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        workers.insert(key, tokio::spawn(worker.run()));
        true
    }

    /// Stop the worker for `key`, if any.
    pub fn stop(&self, key: &DetectorKey) -> bool {
        let mut workers = self.workers.lock().expect("monitor lock poisoned");
        match workers.remove(key) {
            Some(handle) => {
                info!(key = %key, "stopping detector worker");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Keys with a live worker
    pub fn active_keys(&self) -> Vec<DetectorKey> {
        let workers = self.workers.lock().expect("monitor lock poisoned");
        workers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Abort every worker. Called on shutdown.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().expect("monitor lock poisoned");
        for (key, handle) in workers.drain() {
            info!(key = %key, "stopping detector worker");
            handle.abort();
        }
    }
}

impl Drop for SignalMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::errors::GatewayResult;
    use crate::common::types::{
        Balance, Candle, Exchange, OrderAck, OrderRequest, Position, ProtectiveAck,
        ProtectiveRequest,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct EmptyGateway;

    #[async_trait]
    impl ExchangeOps for EmptyGateway {
        async fn get_candles(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> GatewayResult<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn get_balance(&self, _cred: &ExchangeCredential) -> GatewayResult<Balance> {
            unimplemented!()
        }
        async fn get_current_price(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
        ) -> GatewayResult<Decimal> {
            unimplemented!()
        }
        async fn get_positions(
            &self,
            _cred: &ExchangeCredential,
        ) -> GatewayResult<Vec<Position>> {
            unimplemented!()
        }
        async fn place_order(
            &self,
            _cred: &ExchangeCredential,
            _request: &OrderRequest,
        ) -> GatewayResult<OrderAck> {
            unimplemented!()
        }
        async fn attach_protective(
            &self,
            _cred: &ExchangeCredential,
            _request: &ProtectiveRequest,
        ) -> GatewayResult<ProtectiveAck> {
            unimplemented!()
        }
        async fn close_position(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
        ) -> GatewayResult<OrderAck> {
            unimplemented!()
        }
        async fn cancel_all_orders(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
        ) -> GatewayResult<()> {
            unimplemented!()
        }
    }

    fn key(symbol: &str) -> DetectorKey {
        DetectorKey {
            user_id: "u1".to_string(),
            exchange: Exchange::Binance,
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
        }
    }

    fn cred() -> ExchangeCredential {
        ExchangeCredential {
            exchange: Exchange::Binance,
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            passphrase: None,
            is_futures: true,
        }
    }

    fn monitor() -> SignalMonitor {
        let (tx, _rx) = mpsc::channel(16);
        SignalMonitor::new(
            Arc::new(EmptyGateway),
            crate::config::types::DetectorConfig::default(),
            tx,
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let monitor = monitor();
        assert!(monitor.start(key("BTCUSDT"), cred()));
        assert!(!monitor.start(key("BTCUSDT"), cred()));
        assert_eq!(monitor.active_keys().len(), 1);

        assert!(monitor.start(key("ETHUSDT"), cred()));
        assert_eq!(monitor.active_keys().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_removes_worker() {
        let monitor = monitor();
        monitor.start(key("BTCUSDT"), cred());

        assert!(monitor.stop(&key("BTCUSDT")));
        assert!(!monitor.stop(&key("BTCUSDT")));
        assert!(monitor.active_keys().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_everything() {
        let monitor = monitor();
        monitor.start(key("BTCUSDT"), cred());
        monitor.start(key("ETHUSDT"), cred());

        monitor.shutdown();
        assert!(monitor.active_keys().is_empty());
    }
}
