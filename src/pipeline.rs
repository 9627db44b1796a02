//! Signal pipeline: the consumer side of the detector channel
//!
//! One task drains [`DetectorEvent`]s and, per signal: appends it to the
//! per-user audit trail, writes the EMA pair through to the store for
//! observability, fans it out to feed connections and, when the owning
//! user has auto-trading enabled, hands a trade intent to the dispatcher.
//!
//! Persistence here is best-effort: a store hiccup must never cost the
//! broadcast or the trade.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::common::errors::DispatchError;
use crate::common::types::{AutoTradeSettings, PositionSide, Signal, TradeIntent};
use crate::detector::DetectorEvent;
use crate::dispatch::TradeDispatcher;
use crate::store::{paths, DocumentStore};

pub struct SignalPipeline {
    store: Arc<dyn DocumentStore>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Arc<TradeDispatcher>,
}

impl SignalPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        broadcaster: Arc<Broadcaster>,
        dispatcher: Arc<TradeDispatcher>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            dispatcher,
        }
    }

    /// Drain the event channel until every sender is gone.
    pub async fn run(self, mut events: mpsc::Receiver<DetectorEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DetectorEvent::Signal(signal) => self.handle_signal(signal).await,
                DetectorEvent::FetchFailed { key, error } => {
                    warn!(key = %key, error = %error, "detector poll failed");
                }
            }
        }
        info!("signal pipeline drained, shutting down");
    }

    async fn handle_signal(&self, signal: Signal) {
        info!(
            user = %signal.user_id,
            symbol = %signal.symbol,
            signal = %signal.signal_type,
            price = signal.price,
            "crossover signal"
        );

        self.audit(&signal).await;

        let delivered = self.broadcaster.publish(&signal);
        info!(delivered, "signal broadcast");

        if let Err(err) = self.auto_trade(&signal).await {
            match err {
                DispatchError::LimitExceeded { current, max } => {
                    info!(user = %signal.user_id, current, max, "auto-trade skipped: plan limit reached");
                }
                DispatchError::CredentialsMissing { exchange } => {
                    warn!(user = %signal.user_id, %exchange, "auto-trade skipped: no credentials");
                }
                err => error!(user = %signal.user_id, error = %err, "auto-trade failed"),
            }
        }
    }

    /// Append-only audit record plus EMA write-through.
    async fn audit(&self, signal: &Signal) {
        let audit_path = paths::signal(&signal.user_id, signal.detected_at.timestamp_millis());
        match serde_json::to_value(signal) {
            Ok(doc) => {
                if let Err(err) = self.store.set(&audit_path, doc).await {
                    warn!(error = %err, "failed to persist signal audit record");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize signal"),
        }

        let ema_path = paths::ema_cache(
            &signal.user_id,
            signal.exchange,
            &signal.symbol,
            &signal.interval,
        );
        let ema_doc = json!({
            "fast": signal.ema_fast,
            "slow": signal.ema_slow,
            "updated_at": signal.detected_at.to_rfc3339(),
        });
        if let Err(err) = self.store.set(&ema_path, ema_doc).await {
            warn!(error = %err, "failed to persist EMA cache");
        }
    }

    async fn auto_trade(&self, signal: &Signal) -> Result<(), DispatchError> {
        let settings = self.auto_settings(&signal.user_id).await;
        if !settings.enabled {
            return Ok(());
        }

        let intent = TradeIntent {
            user_id: signal.user_id.clone(),
            exchange: signal.exchange,
            symbol: signal.symbol.clone(),
            side: PositionSide::from_signal(signal.signal_type),
            amount: settings.amount,
            leverage: settings.leverage,
            tp_pct: settings.tp_pct,
            sl_pct: settings.sl_pct,
            client_order_id: None,
        };
        let record = self.dispatcher.dispatch(intent).await?;
        info!(
            client_order_id = %record.client_order_id,
            status = ?record.status,
            "auto-trade dispatched"
        );
        Ok(())
    }

    /// Missing or unreadable settings mean auto-trading stays off.
    async fn auto_settings(&self, user_id: &str) -> AutoTradeSettings {
        match self.store.get(&paths::auto_trading(user_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|err| {
                warn!(user = %user_id, error = %err, "unreadable auto-trading settings");
                AutoTradeSettings::default()
            }),
            Ok(None) => AutoTradeSettings::default(),
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to read auto-trading settings");
                AutoTradeSettings::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::errors::GatewayResult;
    use crate::common::types::{
        Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
        ProtectiveAck, ProtectiveRequest, SignalType, TradeStatus,
    };
    use crate::config::types::BroadcastConfig;
    use crate::exchange::ExchangeOps;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Happy-path gateway: fills everything instantly at a fixed price.
    struct FixedPriceGateway;

    #[async_trait]
    impl ExchangeOps for FixedPriceGateway {
        async fn place_order(
            &self,
            _cred: &ExchangeCredential,
            request: &OrderRequest,
        ) -> GatewayResult<OrderAck> {
            Ok(OrderAck {
                order_id: "x1".to_string(),
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                avg_price: Some(dec!(43000)),
            })
        }

        async fn attach_protective(
            &self,
            _cred: &ExchangeCredential,
            _request: &ProtectiveRequest,
        ) -> GatewayResult<ProtectiveAck> {
            Ok(ProtectiveAck {
                tp_order_id: Some("tp1".to_string()),
                sl_order_id: Some("sl1".to_string()),
            })
        }

        async fn get_current_price(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
        ) -> GatewayResult<Decimal> {
            Ok(dec!(43000))
        }

        async fn get_balance(&self, _cred: &ExchangeCredential) -> GatewayResult<Balance> {
            unimplemented!()
        }
        async fn get_positions(
            &self,
            _cred: &ExchangeCredential,
        ) -> GatewayResult<Vec<Position>> {
            unimplemented!()
        }
        async fn get_candles(
            &self,
            _cred: &ExchangeCredential,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> GatewayResult<Vec<Candle>> {
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

    fn signal() -> Signal {
        Signal {
            user_id: "alice".to_string(),
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            signal_type: SignalType::Buy,
            ema_fast: 43010.0,
            ema_slow: 42990.0,
            price: 43000.0,
            detected_at: Utc::now(),
        }
    }

    async fn pipeline_with_store() -> (SignalPipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(FixedPriceGateway);
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        let dispatcher = Arc::new(TradeDispatcher::new(gateway, store.clone()));
        (
            SignalPipeline::new(store.clone(), broadcaster, dispatcher),
            store,
        )
    }

    async fn store_credentials(store: &InMemoryStore, user: &str) {
        let cred = ExchangeCredential {
            exchange: Exchange::Binance,
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            passphrase: None,
            is_futures: true,
        };
        store
            .set(
                &paths::credentials(user, Exchange::Binance),
                serde_json::to_value(&cred).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_is_audited_even_without_auto_trading() {
        let (pipeline, store) = pipeline_with_store().await;
        let signal = signal();

        pipeline.handle_signal(signal.clone()).await;

        let audit = store
            .get(&paths::signal(
                "alice",
                signal.detected_at.timestamp_millis(),
            ))
            .await
            .unwrap()
            .expect("audit record written");
        assert_eq!(audit["symbol"], "BTCUSDT");

        let ema = store
            .get(&paths::ema_cache(
                "alice",
                Exchange::Binance,
                "BTCUSDT",
                "15m",
            ))
            .await
            .unwrap()
            .expect("ema cache written");
        assert_eq!(ema["fast"], 43010.0);

        // No settings: no trade records.
        assert!(store.get(&paths::trades("alice")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enabled_auto_trading_dispatches_a_trade() {
        let (pipeline, store) = pipeline_with_store().await;
        store_credentials(&store, "alice").await;
        let settings = AutoTradeSettings {
            enabled: true,
            ..AutoTradeSettings::default()
        };
        store
            .set(
                &paths::auto_trading("alice"),
                serde_json::to_value(&settings).unwrap(),
            )
            .await
            .unwrap();

        pipeline.handle_signal(signal()).await;

        let trades = store
            .get(&paths::trades("alice"))
            .await
            .unwrap()
            .expect("trade stored");
        let records = trades.as_object().unwrap();
        assert_eq!(records.len(), 1);
        let record = records.values().next().unwrap();
        assert_eq!(record["status"], "open");
        assert_eq!(record["side"], "LONG");
        assert_eq!(record["tp_order_id"], "tp1");
    }

    #[tokio::test]
    async fn test_disabled_auto_trading_only_broadcasts() {
        let (pipeline, store) = pipeline_with_store().await;
        store_credentials(&store, "alice").await;
        store
            .set(
                &paths::auto_trading("alice"),
                serde_json::to_value(AutoTradeSettings::default()).unwrap(),
            )
            .await
            .unwrap();

        pipeline.handle_signal(signal()).await;

        assert!(store.get(&paths::trades("alice")).await.unwrap().is_none());
    }
}
