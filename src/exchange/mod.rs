//! Unified exchange gateway
//!
//! One normalized client per exchange behind a single capability trait.
//! Request signing, symbol quirks and per-exchange error codes stay inside
//! the per-exchange [`ExchangeApi`] implementations; [`ExchangeGateway`]
//! adds the shared policy layer (pacing + retry) and is the only surface the
//! rest of the system sees, as [`ExchangeOps`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{instrument, warn};

use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    ProtectiveAck, ProtectiveRequest,
};
use crate::config::types::GatewayConfig;

pub mod binance;
pub mod bybit;
pub mod http;
pub mod kucoin;
pub mod mexc;
pub mod okx;
pub mod rate_limit;
pub mod retry;
pub mod sign;

pub use rate_limit::RequestPacer;
pub use retry::RetryPolicy;

/// Exchanges report leverage as a decimal string ("10", "12.5"); positions
/// only ever carry whole-number leverage in this system.
pub(crate) fn to_leverage(value: Decimal) -> u32 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_u32().unwrap_or(1)
}

/// Raw per-exchange client: HTTP, signing and response mapping only.
/// No retry, no pacing — that is the gateway's job.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance>;

    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal>;

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>>;

    /// Closed-candle history, oldest first. The most recent entry may be
    /// the partially-formed current candle; callers decide what to trust.
    async fn get_candles(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> GatewayResult<Vec<Candle>>;

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck>;

    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck>;

    /// Reduce-only market order in the opposite direction for the full
    /// open quantity. Does NOT cancel resting orders; the gateway layers
    /// that on unconditionally.
    async fn close_position(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck>;

    async fn cancel_all_orders(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<()>;
}

/// What the detector, dispatcher and API layer call. Implemented by
/// [`ExchangeGateway`] for production and by hand-rolled fakes in tests.
#[async_trait]
pub trait ExchangeOps: Send + Sync {
    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance>;

    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal>;

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>>;

    async fn get_candles(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> GatewayResult<Vec<Candle>>;

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck>;

    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck>;

    /// Two-step close protocol: reduce-only market close, then an
    /// unconditional cancel of all resting orders for the symbol.
    async fn close_position(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck>;

    async fn cancel_all_orders(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<()>;
}

/// Policy-wrapping gateway over the per-exchange clients
pub struct ExchangeGateway {
    apis: HashMap<Exchange, Arc<dyn ExchangeApi>>,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

impl ExchangeGateway {
    /// Build a gateway with all five production clients sharing one
    /// HTTP client.
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        let mut apis: HashMap<Exchange, Arc<dyn ExchangeApi>> = HashMap::new();
        apis.insert(
            Exchange::Binance,
            Arc::new(binance::BinanceClient::new(client.clone())),
        );
        apis.insert(
            Exchange::Bybit,
            Arc::new(bybit::BybitClient::new(client.clone())),
        );
        apis.insert(Exchange::Okx, Arc::new(okx::OkxClient::new(client.clone())));
        apis.insert(
            Exchange::Kucoin,
            Arc::new(kucoin::KucoinClient::new(client.clone())),
        );
        apis.insert(Exchange::Mexc, Arc::new(mexc::MexcClient::new(client)));

        Ok(Self::with_apis(apis, config))
    }

    /// Build a gateway over caller-supplied clients (tests, sandboxes)
    pub fn with_apis(
        apis: HashMap<Exchange, Arc<dyn ExchangeApi>>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            apis,
            pacer: RequestPacer::new(Duration::from_millis(config.min_request_interval_ms)),
            retry: RetryPolicy::from_config(config),
        }
    }

    fn api(&self, exchange: Exchange) -> GatewayResult<&Arc<dyn ExchangeApi>> {
        self.apis.get(&exchange).ok_or(GatewayError::Exchange {
            exchange,
            message: "no client registered for exchange".to_string(),
        })
    }

    async fn pace(&self, cred: &ExchangeCredential) {
        self.pacer.acquire(cred.exchange, &cred.api_key).await;
    }
}

#[async_trait]
impl ExchangeOps for ExchangeGateway {
    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("get_balance", || async {
                self.pace(cred).await;
                api.get_balance(cred).await
            })
            .await
    }

    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("get_current_price", || async {
                self.pace(cred).await;
                api.get_current_price(cred, symbol).await
            })
            .await
    }

    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("get_positions", || async {
                self.pace(cred).await;
                api.get_positions(cred).await
            })
            .await
    }

    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn get_candles(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> GatewayResult<Vec<Candle>> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("get_candles", || async {
                self.pace(cred).await;
                api.get_candles(cred, symbol, interval, limit).await
            })
            .await
    }

    #[instrument(skip(self, cred, request), fields(exchange = %cred.exchange, symbol = %request.symbol))]
    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("place_order", || async {
                self.pace(cred).await;
                api.place_order(cred, request).await
            })
            .await
    }

    #[instrument(skip(self, cred, request), fields(exchange = %cred.exchange, symbol = %request.symbol))]
    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("attach_protective", || async {
                self.pace(cred).await;
                api.attach_protective(cred, request).await
            })
            .await
    }

    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn close_position(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck> {
        let api = self.api(cred.exchange)?;
        let close_result = self
            .retry
            .run("close_position", || async {
                self.pace(cred).await;
                api.close_position(cred, symbol).await
            })
            .await;

        // The order sweep runs regardless of how the market close went;
        // its own failure is only logged.
        if let Err(err) = self
            .retry
            .run("cancel_all_orders", || async {
                self.pace(cred).await;
                api.cancel_all_orders(cred, symbol).await
            })
            .await
        {
            warn!(
                exchange = %cred.exchange,
                symbol,
                error = %err,
                "failed to cancel resting orders after close"
            );
        }

        close_result
    }

    #[instrument(skip(self, cred), fields(exchange = %cred.exchange))]
    async fn cancel_all_orders(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<()> {
        let api = self.api(cred.exchange)?;
        self.retry
            .run("cancel_all_orders", || async {
                self.pace(cred).await;
                api.cancel_all_orders(cred, symbol).await
            })
            .await
    }
}
