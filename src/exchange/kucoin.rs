//! KuCoin client (spot + futures)
//!
//! Spot and futures live on different hosts with different symbol schemes:
//! spot wants `BTC-USDT`, futures wants `XBTUSDTM`. Signs with
//! base64-encoded HMAC-SHA256 over `timestamp + method + path + body`
//! (millisecond unix timestamp), and the v2 key scheme additionally signs
//! the passphrase itself. Rejections arrive as a non-`200000` `code` inside
//! a 200 response.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::http::{check_response, classify_body};
use super::sign::hmac_sha256_base64;
use super::ExchangeApi;
use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    PositionSide, ProtectiveAck, ProtectiveRequest,
};

const SPOT_BASE_URL: &str = "https://api.kucoin.com";
const FUTURES_BASE_URL: &str = "https://api-futures.kucoin.com";

/// KuCoin REST client
#[derive(Debug, Clone)]
pub struct KucoinClient {
    client: Client,
    spot_url: String,
    futures_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountOverview {
    account_equity: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    currency: String,
    #[serde(rename = "type")]
    account_type: String,
    balance: Decimal,
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesPosition {
    symbol: String,
    current_qty: Decimal,
    avg_entry_price: Decimal,
    mark_price: Decimal,
    unrealised_pnl: Decimal,
    real_leverage: Decimal,
    is_open: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    order_id: String,
}

impl KucoinClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            spot_url: SPOT_BASE_URL.to_string(),
            futures_url: FUTURES_BASE_URL.to_string(),
        }
    }

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

    /// `BTCUSDT` becomes `XBTUSDTM` on futures and `BTC-USDT` on spot.
    fn map_symbol(symbol: &str, is_futures: bool) -> String {
        if is_futures {
            let renamed = if let Some(rest) = symbol.strip_prefix("BTC") {
                format!("XBT{}", rest)
            } else {
                symbol.to_string()
            };
            format!("{}M", renamed)
        } else {
            let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
            format!("{}-USDT", base)
        }
    }

    fn unmap_futures_symbol(symbol: &str) -> String {
        let trimmed = symbol.strip_suffix('M').unwrap_or(symbol);
        if let Some(rest) = trimmed.strip_prefix("XBT") {
            format!("BTC{}", rest)
        } else {
            trimmed.to_string()
        }
    }

    /// Futures klines take a granularity in whole minutes.
    fn granularity_minutes(interval: &str) -> u32 {
        match interval {
            "1m" => 1,
            "5m" => 5,
            "15m" => 15,
            "30m" => 30,
            "1h" => 60,
            "4h" => 240,
            "1d" => 1440,
            _ => 60,
        }
    }

    fn spot_candle_type(interval: &str) -> &'static str {
        match interval {
            "1m" => "1min",
            "5m" => "5min",
            "15m" => "15min",
            "30m" => "30min",
            "1h" => "1hour",
            "4h" => "4hour",
            "1d" => "1day",
            _ => "1hour",
        }
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        is_futures: bool,
        method: &str,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> GatewayResult<T> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let message = format!("{}{}{}{}", timestamp, method, path_and_query, body_text);
        let signature = hmac_sha256_base64(Exchange::Kucoin, &cred.api_secret, &message)?;
        let passphrase = cred.passphrase.as_deref().ok_or_else(|| {
            GatewayError::Authentication {
                exchange: Exchange::Kucoin,
                message: "credential is missing the API passphrase".to_string(),
            }
        })?;
        let signed_passphrase =
            hmac_sha256_base64(Exchange::Kucoin, &cred.api_secret, passphrase)?;

        let url = format!("{}{}", self.base_url(is_futures), path_and_query);
        let mut request = match method {
            "POST" => self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body_text),
            "DELETE" => self.client.delete(&url),
            _ => self.client.get(&url),
        };
        request = request
            .header("KC-API-KEY", &cred.api_key)
            .header("KC-API-SIGN", signature)
            .header("KC-API-TIMESTAMP", timestamp)
            .header("KC-API-PASSPHRASE", signed_passphrase)
            .header("KC-API-KEY-VERSION", "2");

        let response = check_response(Exchange::Kucoin, request.send().await?).await?;
        unwrap_envelope(response.json::<Envelope<T>>().await?)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        is_futures: bool,
        path_and_query: &str,
    ) -> GatewayResult<T> {
        let url = format!("{}{}", self.base_url(is_futures), path_and_query);
        let response =
            check_response(Exchange::Kucoin, self.client.get(&url).send().await?).await?;
        unwrap_envelope(response.json::<Envelope<T>>().await?)
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "buy",
            PositionSide::Short => "sell",
        }
    }

    fn client_oid(symbol: &str) -> String {
        format!("{}-{}", symbol, Utc::now().timestamp_millis())
    }

    /// Futures stop order that closes the position at market when touched.
    /// `stop` is "up" or "down" relative to the mark price.
    async fn place_stop(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
        stop: &'static str,
        stop_price: Decimal,
    ) -> GatewayResult<String> {
        let symbol = Self::map_symbol(&request.symbol, true);
        let body = json!({
            "clientOid": Self::client_oid(&symbol),
            "symbol": symbol,
            "side": Self::order_side(request.side.opposite()),
            "type": "market",
            "stop": stop,
            "stopPrice": stop_price.round_dp(2).to_string(),
            "stopPriceType": "MP",
            "closeOrder": true,
        });
        let data: OrderData = self
            .signed_request(cred, true, "POST", "/api/v1/orders", Some(&body))
            .await?;
        Ok(data.order_id)
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> GatewayResult<T> {
    if envelope.code != "200000" {
        return Err(classify_body(
            Exchange::Kucoin,
            &format!(
                "code {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            ),
        ));
    }
    envelope
        .data
        .ok_or_else(|| GatewayError::InvalidResponse("missing data field".into()))
}

#[async_trait]
impl ExchangeApi for KucoinClient {
    fn exchange(&self) -> Exchange {
        Exchange::Kucoin
    }

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        if cred.is_futures {
            let data: AccountOverview = self
                .signed_request(
                    cred,
                    true,
                    "GET",
                    "/api/v1/account-overview?currency=USDT",
                    None,
                )
                .await?;
            Ok(Balance {
                exchange: Exchange::Kucoin,
                currency: "USDT".to_string(),
                total: data.account_equity,
                available: data.available_balance,
                locked: data.account_equity - data.available_balance,
                timestamp: Utc::now(),
            })
        } else {
            let accounts: Vec<SpotAccount> = self
                .signed_request(cred, false, "GET", "/api/v1/accounts?currency=USDT", None)
                .await?;
            let trade = accounts
                .into_iter()
                .find(|a| a.currency == "USDT" && a.account_type == "trade");
            let (total, available) = trade.map(|a| (a.balance, a.available)).unwrap_or_default();
            Ok(Balance {
                exchange: Exchange::Kucoin,
                currency: "USDT".to_string(),
                total,
                available,
                locked: total - available,
                timestamp: Utc::now(),
            })
        }
    }

    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal> {
        let data: TickerData = if cred.is_futures {
            let path = format!("/api/v1/ticker?symbol={}", Self::map_symbol(symbol, true));
            self.public_get(true, &path).await?
        } else {
            let path = format!(
                "/api/v1/market/orderbook/level1?symbol={}",
                Self::map_symbol(symbol, false)
            );
            self.public_get(false, &path).await?
        };
        Ok(data.price)
    }

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        if !cred.is_futures {
            return Ok(Vec::new());
        }

        let data: Vec<FuturesPosition> = self
            .signed_request(cred, true, "GET", "/api/v1/positions", None)
            .await?;

        Ok(data
            .into_iter()
            .filter(|p| p.is_open && !p.current_qty.is_zero())
            .map(|p| Position {
                exchange: Exchange::Kucoin,
                symbol: Self::unmap_futures_symbol(&p.symbol),
                side: if p.current_qty > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                amount: p.current_qty.abs(),
                entry_price: p.avg_entry_price,
                current_price: p.mark_price,
                unrealized_pnl: p.unrealised_pnl,
                leverage: super::to_leverage(p.real_leverage),
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
        if cred.is_futures {
            let granularity = Self::granularity_minutes(interval);
            let span_ms = i64::from(granularity) * 60_000 * i64::from(limit);
            let now_ms = Utc::now().timestamp_millis();
            let path = format!(
                "/api/v1/kline/query?symbol={}&granularity={}&from={}&to={}",
                Self::map_symbol(symbol, true),
                granularity,
                now_ms - span_ms,
                now_ms
            );
            // Rows are numeric arrays, oldest first: [timeMs, open, high, low, close, volume].
            let rows: Vec<Vec<f64>> = self.public_get(true, &path).await?;
            rows.into_iter()
                .map(|row| {
                    let open_time_ms = row.first().copied().ok_or_else(|| {
                        GatewayError::InvalidResponse("kline missing timestamp".into())
                    })? as i64;
                    let close = row.get(4).copied().ok_or_else(|| {
                        GatewayError::InvalidResponse("kline missing close".into())
                    })?;
                    let open_time = Utc
                        .timestamp_millis_opt(open_time_ms)
                        .single()
                        .ok_or_else(|| {
                            GatewayError::InvalidResponse("kline timestamp out of range".into())
                        })?;
                    Ok(Candle { open_time, close })
                })
                .collect()
        } else {
            let path = format!(
                "/api/v1/market/candles?type={}&symbol={}",
                Self::spot_candle_type(interval),
                Self::map_symbol(symbol, false)
            );
            // Spot rows are string arrays, newest first, with close at
            // index 2 and the timestamp in whole seconds.
            let rows: Vec<Vec<String>> = self.public_get(false, &path).await?;
            let mut candles: Vec<Candle> = rows
                .into_iter()
                .take(limit as usize)
                .map(|row| {
                    let open_time_s = row
                        .first()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            GatewayError::InvalidResponse("candle missing timestamp".into())
                        })?;
                    let close = row.get(2).and_then(|s| s.parse::<f64>().ok()).ok_or_else(
                        || GatewayError::InvalidResponse("candle missing close".into()),
                    )?;
                    let open_time = Utc
                        .timestamp_opt(open_time_s, 0)
                        .single()
                        .ok_or_else(|| {
                            GatewayError::InvalidResponse("candle timestamp out of range".into())
                        })?;
                    Ok(Candle { open_time, close })
                })
                .collect::<GatewayResult<_>>()?;
            candles.reverse();
            Ok(candles)
        }
    }

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        let data: OrderData = if cred.is_futures {
            let symbol = Self::map_symbol(&request.symbol, true);
            let mut body = json!({
                "clientOid": Self::client_oid(&symbol),
                "symbol": symbol,
                "side": Self::order_side(request.side),
                "type": "market",
                "leverage": request.leverage.to_string(),
                "size": request.quantity.to_string(),
            });
            if request.reduce_only {
                body["reduceOnly"] = json!(true);
            }
            self.signed_request(cred, true, "POST", "/api/v1/orders", Some(&body))
                .await?
        } else {
            let symbol = Self::map_symbol(&request.symbol, false);
            let body = json!({
                "clientOid": Self::client_oid(&symbol),
                "symbol": symbol,
                "side": Self::order_side(request.side),
                "type": "market",
                "size": request.quantity.to_string(),
            });
            self.signed_request(cred, false, "POST", "/api/v1/orders", Some(&body))
                .await?
        };

        Ok(OrderAck {
            order_id: data.order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            avg_price: None,
        })
    }

    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck> {
        let mut ack = ProtectiveAck::default();

        // Trigger direction is relative to the mark price: a long's TP fires
        // above it, its SL below; mirrored for shorts.
        let (tp_stop, sl_stop) = match request.side {
            PositionSide::Long => ("up", "down"),
            PositionSide::Short => ("down", "up"),
        };

        if let Some(tp) = request.tp_price {
            let id = self.place_stop(cred, request, tp_stop, tp).await?;
            ack.tp_order_id = Some(id);
        }
        if let Some(sl) = request.sl_price {
            let id = self.place_stop(cred, request, sl_stop, sl).await?;
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
                exchange: Exchange::Kucoin,
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
        if cred.is_futures {
            let mapped = Self::map_symbol(symbol, true);
            let path = format!("/api/v1/orders?symbol={}", mapped);
            self.signed_request::<serde_json::Value>(cred, true, "DELETE", &path, None)
                .await?;
            // Resting stops live in a separate book.
            let stops = format!("/api/v1/stopOrders?symbol={}", mapped);
            self.signed_request::<serde_json::Value>(cred, true, "DELETE", &stops, None)
                .await?;
        } else {
            let path = format!("/api/v1/orders?symbol={}", Self::map_symbol(symbol, false));
            self.signed_request::<serde_json::Value>(cred, false, "DELETE", &path, None)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(KucoinClient::map_symbol("BTCUSDT", true), "XBTUSDTM");
        assert_eq!(KucoinClient::map_symbol("ETHUSDT", true), "ETHUSDTM");
        assert_eq!(KucoinClient::map_symbol("BTCUSDT", false), "BTC-USDT");
        assert_eq!(KucoinClient::unmap_futures_symbol("XBTUSDTM"), "BTCUSDT");
        assert_eq!(KucoinClient::unmap_futures_symbol("ETHUSDTM"), "ETHUSDT");
    }

    #[test]
    fn test_envelope_rejection_classified() {
        let envelope: Envelope<TickerData> = Envelope {
            code: "400004".to_string(),
            msg: Some("Invalid KC-API-PASSPHRASE".to_string()),
            data: None,
        };
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }
}
