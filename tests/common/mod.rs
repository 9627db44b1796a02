//! Shared test doubles and store seeding helpers

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ema_navigator::common::errors::{GatewayError, GatewayResult};
use ema_navigator::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, PlanTier, Position,
    ProtectiveAck, ProtectiveRequest,
};
use ema_navigator::exchange::ExchangeOps;
use ema_navigator::store::{paths, DocumentStore, InMemoryStore};

/// Gateway double that records every call and can be told to fail the next
/// N entry orders or protective attachments.
pub struct RecordingGateway {
    pub price: Decimal,
    pub close_price: Decimal,
    pub orders: Mutex<Vec<OrderRequest>>,
    pub protective_requests: Mutex<Vec<ProtectiveRequest>>,
    pub closed_symbols: Mutex<Vec<String>>,
    pub place_failures: AtomicU32,
    pub protective_failures: AtomicU32,
    next_order_id: AtomicU32,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self {
            price: dec!(43000),
            close_price: dec!(45150),
            orders: Mutex::new(Vec::new()),
            protective_requests: Mutex::new(Vec::new()),
            closed_symbols: Mutex::new(Vec::new()),
            place_failures: AtomicU32::new(0),
            protective_failures: AtomicU32::new(0),
            next_order_id: AtomicU32::new(1),
        }
    }
}

impl RecordingGateway {
    pub fn orders_placed(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.closed_symbols.lock().unwrap().len()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangeOps for RecordingGateway {
    async fn place_order(
        &self,
        _cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        if Self::take_failure(&self.place_failures) {
            return Err(GatewayError::InsufficientBalance {
                exchange: Exchange::Binance,
                message: "margin is insufficient".to_string(),
            });
        }
        self.orders.lock().unwrap().push(request.clone());
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: format!("x{}", id),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            avg_price: Some(if request.reduce_only {
                self.close_price
            } else {
                self.price
            }),
        })
    }

    async fn attach_protective(
        &self,
        _cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck> {
        if Self::take_failure(&self.protective_failures) {
            return Err(GatewayError::Exchange {
                exchange: Exchange::Binance,
                message: "order would trigger immediately".to_string(),
            });
        }
        self.protective_requests.lock().unwrap().push(request.clone());
        Ok(ProtectiveAck {
            tp_order_id: request.tp_price.map(|_| "tp1".to_string()),
            sl_order_id: request.sl_price.map(|_| "sl1".to_string()),
        })
    }

    async fn close_position(
        &self,
        _cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck> {
        self.closed_symbols.lock().unwrap().push(symbol.to_string());
        Ok(OrderAck {
            order_id: "close1".to_string(),
            symbol: symbol.to_string(),
            side: ema_navigator::common::types::PositionSide::Short,
            quantity: Decimal::ONE,
            avg_price: Some(self.close_price),
        })
    }

    async fn get_current_price(
        &self,
        _cred: &ExchangeCredential,
        _symbol: &str,
    ) -> GatewayResult<Decimal> {
        Ok(self.price)
    }

    async fn get_balance(&self, _cred: &ExchangeCredential) -> GatewayResult<Balance> {
        Ok(Balance {
            exchange: Exchange::Binance,
            currency: "USDT".to_string(),
            total: dec!(1000),
            available: dec!(1000),
            locked: Decimal::ZERO,
            timestamp: Utc::now(),
        })
    }

    async fn get_positions(&self, _cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn get_candles(
        &self,
        _cred: &ExchangeCredential,
        _symbol: &str,
        _interval: &str,
        _limit: u32,
    ) -> GatewayResult<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn cancel_all_orders(
        &self,
        _cred: &ExchangeCredential,
        _symbol: &str,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

pub async fn seed_credentials(store: &InMemoryStore, user: &str, exchange: Exchange) {
    let cred = ExchangeCredential {
        exchange,
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        passphrase: None,
        is_futures: true,
    };
    store
        .set(
            &paths::credentials(user, exchange),
            serde_json::to_value(&cred).unwrap(),
        )
        .await
        .unwrap();
}

pub async fn seed_plan(store: &InMemoryStore, user: &str, plan: PlanTier) {
    store
        .set(&paths::plan(user), serde_json::to_value(plan).unwrap())
        .await
        .unwrap();
}
