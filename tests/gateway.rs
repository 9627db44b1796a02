//! Gateway-level integration tests: real HTTP against a mock exchange

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ema_navigator::common::errors::{GatewayError, GatewayResult};
use ema_navigator::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    PositionSide, ProtectiveAck, ProtectiveRequest,
};
use ema_navigator::config::types::GatewayConfig;
use ema_navigator::exchange::binance::BinanceClient;
use ema_navigator::exchange::{ExchangeApi, ExchangeGateway, ExchangeOps};

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        request_timeout_seconds: 5,
        min_request_interval_ms: 1,
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    }
}

fn futures_cred() -> ExchangeCredential {
    ExchangeCredential {
        exchange: Exchange::Binance,
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        passphrase: None,
        is_futures: true,
    }
}

async fn binance_gateway(server: &MockServer) -> ExchangeGateway {
    let client = BinanceClient::new(reqwest::Client::new())
        .with_base_urls(&server.uri(), &server.uri());
    let mut apis: HashMap<Exchange, Arc<dyn ExchangeApi>> = HashMap::new();
    apis.insert(Exchange::Binance, Arc::new(client));
    ExchangeGateway::with_apis(apis, &fast_config())
}

#[tokio::test]
async fn test_balance_request_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .and(header("X-MBX-APIKEY", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "totalWalletBalance": "1000.5",
            "availableBalance": "900.25"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = binance_gateway(&server).await;
    let balance = gateway.get_balance(&futures_cred()).await.unwrap();

    assert_eq!(balance.total, dec!(1000.5));
    assert_eq!(balance.available, dec!(900.25));
    assert_eq!(balance.locked, dec!(250.25));
    assert_eq!(balance.currency, "USDT");

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap();
    assert!(query.contains("timestamp="));
    assert!(query.contains("signature="));
}

#[tokio::test]
async fn test_rate_limit_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/price"))
        .respond_with(ResponseTemplate::new(429).set_body_string("too many requests"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "symbol": "BTCUSDT",
            "price": "43000.5"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = binance_gateway(&server).await;
    let price = gateway
        .get_current_price(&futures_cred(), "BTCUSDT")
        .await
        .unwrap();

    assert_eq!(price, dec!(43000.5));
}

#[tokio::test]
async fn test_authentication_failure_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "code": -2014,
            "msg": "API-key format invalid."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = binance_gateway(&server).await;
    let err = gateway.get_balance(&futures_cred()).await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Authentication {
            exchange: Exchange::Binance,
            ..
        }
    ));
}

#[tokio::test]
async fn test_insufficient_margin_classified_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/leverage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "leverage": 10,
            "symbol": "BTCUSDT"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "code": -2019,
            "msg": "Margin is insufficient."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = binance_gateway(&server).await;
    let request = OrderRequest {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        quantity: dec!(0.01),
        leverage: 10,
        reduce_only: false,
    };
    let err = gateway
        .place_order(&futures_cred(), &request)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::InsufficientBalance { .. }));
}

#[tokio::test]
async fn test_server_errors_exhaust_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/price"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let gateway = binance_gateway(&server).await;
    let err = gateway
        .get_current_price(&futures_cred(), "BTCUSDT")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::TransientNetwork(_)));
}

/// Close must always be followed by an order sweep, even when the market
/// close itself fails.
struct FailingCloseApi {
    cancels: AtomicU32,
}

#[async_trait]
impl ExchangeApi for FailingCloseApi {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn close_position(
        &self,
        _cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck> {
        Err(GatewayError::Exchange {
            exchange: Exchange::Binance,
            message: format!("no open position for {}", symbol),
        })
    }

    async fn cancel_all_orders(
        &self,
        _cred: &ExchangeCredential,
        _symbol: &str,
    ) -> GatewayResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
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
    async fn get_positions(&self, _cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
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
}

#[tokio::test]
async fn test_close_sweeps_orders_even_when_close_fails() {
    let api = Arc::new(FailingCloseApi {
        cancels: AtomicU32::new(0),
    });
    let mut apis: HashMap<Exchange, Arc<dyn ExchangeApi>> = HashMap::new();
    apis.insert(Exchange::Binance, api.clone());
    let gateway = ExchangeGateway::with_apis(apis, &fast_config());

    let err = gateway
        .close_position(&futures_cred(), "BTCUSDT")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Exchange { .. }));
    assert_eq!(api.cancels.load(Ordering::SeqCst), 1);
}

/// Price feed that rate-limits its first attempts and stamps when each
/// attempt arrived.
struct RateLimitedPriceApi {
    attempts: Mutex<Vec<tokio::time::Instant>>,
    failures: AtomicU32,
}

#[async_trait]
impl ExchangeApi for RateLimitedPriceApi {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_current_price(
        &self,
        _cred: &ExchangeCredential,
        _symbol: &str,
    ) -> GatewayResult<Decimal> {
        self.attempts.lock().unwrap().push(tokio::time::Instant::now());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GatewayError::RateLimit {
                exchange: Exchange::Binance,
                message: "too many requests".to_string(),
            });
        }
        Ok(dec!(43000))
    }

    async fn get_balance(&self, _cred: &ExchangeCredential) -> GatewayResult<Balance> {
        unimplemented!()
    }
    async fn get_positions(&self, _cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
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

#[tokio::test(start_paused = true)]
async fn test_retry_attempts_respect_request_spacing() {
    let api = Arc::new(RateLimitedPriceApi {
        attempts: Mutex::new(Vec::new()),
        failures: AtomicU32::new(2),
    });
    let mut apis: HashMap<Exchange, Arc<dyn ExchangeApi>> = HashMap::new();
    apis.insert(Exchange::Binance, api.clone());
    let config = GatewayConfig {
        min_request_interval_ms: 100,
        ..fast_config()
    };
    let gateway = ExchangeGateway::with_apis(apis, &config);

    let price = gateway
        .get_current_price(&futures_cred(), "BTCUSDT")
        .await
        .unwrap();
    assert_eq!(price, dec!(43000));

    // Every retried attempt waits for its own pacer slot, so attempts can
    // never land closer together than the per-credential spacing.
    let attempts = api.attempts.lock().unwrap();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1] - pair[0] >= std::time::Duration::from_millis(100));
    }
}

#[tokio::test]
async fn test_unregistered_exchange_rejected() {
    let gateway = ExchangeGateway::with_apis(HashMap::new(), &fast_config());
    let err = gateway.get_balance(&futures_cred()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Exchange { .. }));
}
