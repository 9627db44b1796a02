//! Binance client (spot + USD-M futures)
//!
//! Signs with HMAC-SHA256 over the url-encoded query string, hex encoded,
//! `X-MBX-APIKEY` header. Futures and spot live on different hosts.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::http::check_response;
use super::sign::{hmac_sha256_hex, query_string};
use super::ExchangeApi;
use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    PositionSide, ProtectiveAck, ProtectiveRequest,
};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const FUTURES_BASE_URL: &str = "https://fapi.binance.com";

/// Binance REST client
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    spot_url: String,
    futures_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAccount {
    total_wallet_balance: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    un_realized_profit: Decimal,
    leverage: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    avg_price: Option<Decimal>,
}

impl BinanceClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            spot_url: SPOT_BASE_URL.to_string(),
            futures_url: FUTURES_BASE_URL.to_string(),
        }
    }

    /// Point both hosts somewhere else (test servers)
    pub fn with_base_urls(mut self, spot_url: &str, futures_url: &str) -> Self {
        self.spot_url = spot_url.trim_end_matches('/').to_string();
        self.futures_url = futures_url.trim_end_matches('/').to_string();
        self
    }

    fn base_url(&self, is_futures: bool) -> &str {
        if is_futures {
            &self.futures_url
        } else {
            &self.spot_url
        }
    }

    /// Append timestamp and signature to a parameter list
    fn signed_query(
        &self,
        cred: &ExchangeCredential,
        mut params: Vec<(&'static str, String)>,
    ) -> GatewayResult<String> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = query_string(&params);
        let signature = hmac_sha256_hex(Exchange::Binance, &cred.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed_get(
        &self,
        cred: &ExchangeCredential,
        is_futures: bool,
        path: &str,
        params: Vec<(&'static str, String)>,
    ) -> GatewayResult<reqwest::Response> {
        let query = self.signed_query(cred, params)?;
        let url = format!("{}{}?{}", self.base_url(is_futures), path, query);
        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &cred.api_key)
            .send()
            .await?;
        check_response(Exchange::Binance, response).await
    }

    async fn signed_post(
        &self,
        cred: &ExchangeCredential,
        is_futures: bool,
        path: &str,
        params: Vec<(&'static str, String)>,
    ) -> GatewayResult<reqwest::Response> {
        let body = self.signed_query(cred, params)?;
        let url = format!("{}{}", self.base_url(is_futures), path);
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &cred.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        check_response(Exchange::Binance, response).await
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "BUY",
            PositionSide::Short => "SELL",
        }
    }

    /// Place one TP or SL trigger; direction is opposite the protected side
    async fn place_trigger(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
        order_type: &'static str,
        trigger_price: Decimal,
    ) -> GatewayResult<String> {
        let params = vec![
            ("symbol", request.symbol.clone()),
            ("side", Self::order_side(request.side.opposite()).to_string()),
            ("type", order_type.to_string()),
            ("quantity", request.quantity.to_string()),
            ("stopPrice", trigger_price.round_dp(2).to_string()),
            ("workingType", "MARK_PRICE".to_string()),
            ("reduceOnly", "true".to_string()),
        ];
        let response = self
            .signed_post(cred, cred.is_futures, "/fapi/v1/order", params)
            .await?;
        let ack: OrderResponse = response.json().await?;
        Ok(ack.order_id.to_string())
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        if cred.is_futures {
            let response = self
                .signed_get(cred, true, "/fapi/v2/account", Vec::new())
                .await?;
            let account: FuturesAccount = response.json().await?;
            Ok(Balance {
                exchange: Exchange::Binance,
                currency: "USDT".to_string(),
                total: account.total_wallet_balance,
                available: account.available_balance,
                locked: account.total_wallet_balance - account.available_balance,
                timestamp: Utc::now(),
            })
        } else {
            let response = self
                .signed_get(cred, false, "/api/v3/account", Vec::new())
                .await?;
            let account: SpotAccount = response.json().await?;
            let usdt = account.balances.into_iter().find(|b| b.asset == "USDT");
            let (free, locked) = usdt.map(|b| (b.free, b.locked)).unwrap_or_default();
            Ok(Balance {
                exchange: Exchange::Binance,
                currency: "USDT".to_string(),
                total: free + locked,
                available: free,
                locked,
                timestamp: Utc::now(),
            })
        }
    }

    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal> {
        let path = if cred.is_futures {
            "/fapi/v1/ticker/price"
        } else {
            "/api/v3/ticker/price"
        };
        let url = format!("{}{}?symbol={}", self.base_url(cred.is_futures), path, symbol);
        debug!("Fetching price from: {}", url);

        let response = self.client.get(&url).send().await?;
        let response = check_response(Exchange::Binance, response).await?;
        let ticker: TickerPrice = response.json().await?;
        Ok(ticker.price)
    }

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        if !cred.is_futures {
            // Spot has no position concept.
            return Ok(Vec::new());
        }

        let response = self
            .signed_get(cred, true, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let raw: Vec<PositionRisk> = response.json().await?;

        Ok(raw
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|p| Position {
                exchange: Exchange::Binance,
                symbol: p.symbol,
                side: if p.position_amt > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                amount: p.position_amt.abs(),
                entry_price: p.entry_price,
                current_price: p.mark_price,
                unrealized_pnl: p.un_realized_profit,
                leverage: super::to_leverage(p.leverage),
            })
            .collect())
    }

    async fn get_candles(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> GatewayResult<Vec<Candle>> {
        let path = if cred.is_futures {
            "/fapi/v1/klines"
        } else {
            "/api/v3/klines"
        };
        let url = format!(
            "{}{}?symbol={}&interval={}&limit={}",
            self.base_url(cred.is_futures),
            path,
            symbol,
            interval,
            limit
        );

        let response = self.client.get(&url).send().await?;
        let response = check_response(Exchange::Binance, response).await?;
        // Klines come back as positional arrays: [openTime, open, high, low, close, ...]
        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;

        rows.into_iter()
            .map(|row| {
                let open_time_ms = row
                    .first()
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| GatewayError::InvalidResponse("kline missing open time".into()))?;
                let close = row
                    .get(4)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| GatewayError::InvalidResponse("kline missing close".into()))?;
                let open_time = Utc
                    .timestamp_millis_opt(open_time_ms)
                    .single()
                    .ok_or_else(|| GatewayError::InvalidResponse("kline open time out of range".into()))?;
                Ok(Candle { open_time, close })
            })
            .collect()
    }

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        if cred.is_futures && !request.reduce_only {
            // Leverage must be configured before the entry order. A failure
            // here keeps the account's previous setting, which is not worth
            // aborting the trade over.
            let leverage_params = vec![
                ("symbol", request.symbol.clone()),
                ("leverage", request.leverage.to_string()),
            ];
            if let Err(err) = self
                .signed_post(cred, true, "/fapi/v1/leverage", leverage_params)
                .await
            {
                warn!(symbol = %request.symbol, error = %err, "failed to set leverage");
            }
        }

        let (path, is_futures) = if cred.is_futures {
            ("/fapi/v1/order", true)
        } else {
            ("/api/v3/order", false)
        };

        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", Self::order_side(request.side).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", request.quantity.to_string()),
        ];
        if request.reduce_only && cred.is_futures {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response = self.signed_post(cred, is_futures, path, params).await?;
        let ack: OrderResponse = response.json().await?;

        Ok(OrderAck {
            order_id: ack.order_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            avg_price: ack.avg_price.filter(|p| !p.is_zero()),
        })
    }

    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck> {
        let mut ack = ProtectiveAck::default();

        if let Some(tp_price) = request.tp_price {
            let id = self
                .place_trigger(cred, request, "TAKE_PROFIT_MARKET", tp_price)
                .await?;
            ack.tp_order_id = Some(id);
        }
        if let Some(sl_price) = request.sl_price {
            let id = self
                .place_trigger(cred, request, "STOP_MARKET", sl_price)
                .await?;
            ack.sl_order_id = Some(id);
        }

        Ok(ack)
    }

    async fn close_position(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<OrderAck> {
        let positions = self.get_positions(cred).await?;
        let position = positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| GatewayError::Exchange {
                exchange: Exchange::Binance,
                message: format!("no open position for {}", symbol),
            })?;

        let close_request = OrderRequest {
            symbol: symbol.to_string(),
            side: position.side.opposite(),
            quantity: position.amount,
            leverage: position.leverage,
            reduce_only: true,
        };
        self.place_order(cred, &close_request).await
    }

    async fn cancel_all_orders(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<()> {
        let (path, is_futures) = if cred.is_futures {
            ("/fapi/v1/allOpenOrders", true)
        } else {
            ("/api/v3/openOrders", false)
        };
        let query = self.signed_query(cred, vec![("symbol", symbol.to_string())])?;
        let url = format!("{}{}?{}", self.base_url(is_futures), path, query);

        let response = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &cred.api_key)
            .send()
            .await?;
        check_response(Exchange::Binance, response).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_override_trims_slash() {
        let client = BinanceClient::new(Client::new())
            .with_base_urls("http://localhost:9999/", "http://localhost:9998/");
        assert_eq!(client.spot_url, "http://localhost:9999");
        assert_eq!(client.futures_url, "http://localhost:9998");
    }

    #[test]
    fn test_order_side_mapping() {
        assert_eq!(BinanceClient::order_side(PositionSide::Long), "BUY");
        assert_eq!(BinanceClient::order_side(PositionSide::Short), "SELL");
    }
}
