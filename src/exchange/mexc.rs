//! MEXC client (spot + contract)
//!
//! Two unrelated APIs behind one credential. Spot follows the Binance
//! conventions (signed query string, `X-MEXC-APIKEY` header) on
//! api.mexc.com; contract lives on contract.mexc.com, signs
//! `access_key + timestamp + payload` into a `Signature` header, keys
//! symbols with an underscore (`BTC_USDT`) and encodes order direction as
//! a numeric side code.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::http::{check_response, classify_body};
use super::sign::{hmac_sha256_hex, query_string};
use super::ExchangeApi;
use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    PositionSide, ProtectiveAck, ProtectiveRequest,
};

const SPOT_BASE_URL: &str = "https://api.mexc.com";
const CONTRACT_BASE_URL: &str = "https://contract.mexc.com";

// Contract order side codes.
const SIDE_OPEN_LONG: u8 = 1;
const SIDE_CLOSE_SHORT: u8 = 2;
const SIDE_OPEN_SHORT: u8 = 3;
const SIDE_CLOSE_LONG: u8 = 4;

/// MEXC REST client
#[derive(Debug, Clone)]
pub struct MexcClient {
    client: Client,
    spot_url: String,
    contract_url: String,
}

#[derive(Debug, Deserialize)]
struct ContractEnvelope<T> {
    success: bool,
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractAsset {
    currency: String,
    equity: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractTicker {
    last_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractPosition {
    symbol: String,
    /// 1 = long, 2 = short
    position_type: u8,
    hold_vol: Decimal,
    hold_avg_price: Decimal,
    leverage: Decimal,
    #[serde(default)]
    unrealised: Decimal,
}

/// Contract klines come back column-oriented, oldest first.
#[derive(Debug, Deserialize)]
struct ContractKlines {
    time: Vec<i64>,
    close: Vec<f64>,
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
struct SpotTicker {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotOrder {
    order_id: String,
}

impl MexcClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            spot_url: SPOT_BASE_URL.to_string(),
            contract_url: CONTRACT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_urls(mut self, spot_url: &str, contract_url: &str) -> Self {
        self.spot_url = spot_url.trim_end_matches('/').to_string();
        self.contract_url = contract_url.trim_end_matches('/').to_string();
        self
    }

    /// `BTCUSDT` becomes `BTC_USDT` on the contract API.
    fn contract_symbol(symbol: &str) -> String {
        match symbol.strip_suffix("USDT") {
            Some(base) => format!("{}_USDT", base),
            None => symbol.to_string(),
        }
    }

    fn contract_interval(interval: &str) -> &'static str {
        match interval {
            "1m" => "Min1",
            "5m" => "Min5",
            "15m" => "Min15",
            "30m" => "Min30",
            "1h" => "Min60",
            "4h" => "Hour4",
            "1d" => "Day1",
            _ => "Min60",
        }
    }

    fn contract_side(side: PositionSide, reduce_only: bool) -> u8 {
        match (side, reduce_only) {
            (PositionSide::Long, false) => SIDE_OPEN_LONG,
            (PositionSide::Long, true) => SIDE_CLOSE_SHORT,
            (PositionSide::Short, false) => SIDE_OPEN_SHORT,
            (PositionSide::Short, true) => SIDE_CLOSE_LONG,
        }
    }

    async fn contract_get<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        path: &str,
        query: &str,
    ) -> GatewayResult<T> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let message = format!("{}{}{}", cred.api_key, timestamp, query);
        let signature = hmac_sha256_hex(Exchange::Mexc, &cred.api_secret, &message)?;

        let url = if query.is_empty() {
            format!("{}{}", self.contract_url, path)
        } else {
            format!("{}{}?{}", self.contract_url, path, query)
        };
        let response = self
            .client
            .get(&url)
            .header("ApiKey", &cred.api_key)
            .header("Request-Time", timestamp)
            .header("Signature", signature)
            .send()
            .await?;
        let response = check_response(Exchange::Mexc, response).await?;
        unwrap_contract(response.json::<ContractEnvelope<T>>().await?)
    }

    async fn contract_post<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        path: &str,
        body: &serde_json::Value,
    ) -> GatewayResult<T> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = body.to_string();
        let message = format!("{}{}{}", cred.api_key, timestamp, payload);
        let signature = hmac_sha256_hex(Exchange::Mexc, &cred.api_secret, &message)?;

        let response = self
            .client
            .post(format!("{}{}", self.contract_url, path))
            .header("ApiKey", &cred.api_key)
            .header("Request-Time", timestamp)
            .header("Signature", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        let response = check_response(Exchange::Mexc, response).await?;
        unwrap_contract(response.json::<ContractEnvelope<T>>().await?)
    }

    async fn contract_public<T: DeserializeOwned>(&self, path_and_query: &str) -> GatewayResult<T> {
        let url = format!("{}{}", self.contract_url, path_and_query);
        let response = check_response(Exchange::Mexc, self.client.get(&url).send().await?).await?;
        unwrap_contract(response.json::<ContractEnvelope<T>>().await?)
    }

    /// Binance-style signed query against the spot API.
    async fn spot_signed(
        &self,
        cred: &ExchangeCredential,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> GatewayResult<reqwest::Response> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = query_string(&params);
        let signature = hmac_sha256_hex(Exchange::Mexc, &cred.api_secret, &query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.spot_url, path, query, signature
        );
        let response = self
            .client
            .request(method, &url)
            .header("X-MEXC-APIKEY", &cred.api_key)
            .send()
            .await?;
        check_response(Exchange::Mexc, response).await
    }
}

fn unwrap_contract<T>(envelope: ContractEnvelope<T>) -> GatewayResult<T> {
    if !envelope.success || envelope.code != 0 {
        return Err(classify_body(
            Exchange::Mexc,
            &format!(
                "code {}: {}",
                envelope.code,
                envelope.message.unwrap_or_default()
            ),
        ));
    }
    envelope
        .data
        .ok_or_else(|| GatewayError::InvalidResponse("missing data field".into()))
}

#[async_trait]
impl ExchangeApi for MexcClient {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        if cred.is_futures {
            let assets: Vec<ContractAsset> = self
                .contract_get(cred, "/api/v1/private/account/assets", "")
                .await?;
            let usdt = assets.into_iter().find(|a| a.currency == "USDT");
            let (total, available) = usdt
                .map(|a| (a.equity, a.available_balance))
                .unwrap_or_default();
            Ok(Balance {
                exchange: Exchange::Mexc,
                currency: "USDT".to_string(),
                total,
                available,
                locked: total - available,
                timestamp: Utc::now(),
            })
        } else {
            let response = self
                .spot_signed(cred, reqwest::Method::GET, "/api/v3/account", Vec::new())
                .await?;
            let account: SpotAccount = response.json().await?;
            let usdt = account.balances.into_iter().find(|b| b.asset == "USDT");
            let (free, locked) = usdt.map(|b| (b.free, b.locked)).unwrap_or_default();
            Ok(Balance {
                exchange: Exchange::Mexc,
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
        if cred.is_futures {
            let path = format!(
                "/api/v1/contract/ticker?symbol={}",
                Self::contract_symbol(symbol)
            );
            let ticker: ContractTicker = self.contract_public(&path).await?;
            Ok(ticker.last_price)
        } else {
            let url = format!("{}/api/v3/ticker/price?symbol={}", self.spot_url, symbol);
            let response = check_response(Exchange::Mexc, self.client.get(&url).send().await?).await?;
            let ticker: SpotTicker = response.json().await?;
            Ok(ticker.price)
        }
    }

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        if !cred.is_futures {
            return Ok(Vec::new());
        }

        let raw: Vec<ContractPosition> = self
            .contract_get(cred, "/api/v1/private/position/open_positions", "")
            .await?;

        Ok(raw
            .into_iter()
            .filter(|p| !p.hold_vol.is_zero())
            .map(|p| Position {
                exchange: Exchange::Mexc,
                symbol: p.symbol.replace('_', ""),
                side: if p.position_type == 1 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                amount: p.hold_vol,
                entry_price: p.hold_avg_price,
                // The contract position feed has no mark price.
                current_price: p.hold_avg_price,
                unrealized_pnl: p.unrealised,
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
        if cred.is_futures {
            let path = format!(
                "/api/v1/contract/kline/{}?interval={}",
                Self::contract_symbol(symbol),
                Self::contract_interval(interval)
            );
            let klines: ContractKlines = self.contract_public(&path).await?;

            let mut candles: Vec<Candle> = klines
                .time
                .into_iter()
                .zip(klines.close)
                .map(|(time_s, close)| {
                    let open_time = Utc.timestamp_opt(time_s, 0).single().ok_or_else(|| {
                        GatewayError::InvalidResponse("kline timestamp out of range".into())
                    })?;
                    Ok(Candle { open_time, close })
                })
                .collect::<GatewayResult<_>>()?;
            // Keep only the most recent `limit` entries.
            if candles.len() > limit as usize {
                candles.drain(..candles.len() - limit as usize);
            }
            Ok(candles)
        } else {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit={}",
                self.spot_url, symbol, interval, limit
            );
            let response = check_response(Exchange::Mexc, self.client.get(&url).send().await?).await?;
            let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
            rows.into_iter()
                .map(|row| {
                    let open_time_ms = row.first().and_then(|v| v.as_i64()).ok_or_else(|| {
                        GatewayError::InvalidResponse("kline missing open time".into())
                    })?;
                    let close = row
                        .get(4)
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<f64>().ok())
                        .ok_or_else(|| {
                            GatewayError::InvalidResponse("kline missing close".into())
                        })?;
                    let open_time = Utc
                        .timestamp_millis_opt(open_time_ms)
                        .single()
                        .ok_or_else(|| {
                            GatewayError::InvalidResponse("kline open time out of range".into())
                        })?;
                    Ok(Candle { open_time, close })
                })
                .collect()
        }
    }

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        if cred.is_futures {
            let body = json!({
                "symbol": Self::contract_symbol(&request.symbol),
                "vol": request.quantity.to_string(),
                "leverage": request.leverage,
                "side": Self::contract_side(request.side, request.reduce_only),
                "type": 5,
                "openType": 2,
            });
            // Submit returns the bare order id as the data payload.
            let order_id: serde_json::Value = self
                .contract_post(cred, "/api/v1/private/order/submit", &body)
                .await?;
            let order_id = match order_id {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(GatewayError::InvalidResponse(format!(
                        "unexpected order id payload: {}",
                        other
                    )))
                }
            };
            Ok(OrderAck {
                order_id,
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                avg_price: None,
            })
        } else {
            let params = vec![
                ("symbol", request.symbol.clone()),
                (
                    "side",
                    match request.side {
                        PositionSide::Long => "BUY".to_string(),
                        PositionSide::Short => "SELL".to_string(),
                    },
                ),
                ("type", "MARKET".to_string()),
                ("quantity", request.quantity.to_string()),
            ];
            let response = self
                .spot_signed(cred, reqwest::Method::POST, "/api/v3/order", params)
                .await?;
            let order: SpotOrder = response.json().await?;
            Ok(OrderAck {
                order_id: order.order_id,
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                avg_price: None,
            })
        }
    }

    async fn attach_protective(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
    ) -> GatewayResult<ProtectiveAck> {
        let mut ack = ProtectiveAck::default();
        let symbol = Self::contract_symbol(&request.symbol);
        let close_side = Self::contract_side(request.side.opposite(), true);

        // Trigger comparisons relative to the trade direction: a long's TP
        // fires at-or-above (1), its SL at-or-below (2); mirrored for shorts.
        let (tp_trigger, sl_trigger) = match request.side {
            PositionSide::Long => (1, 2),
            PositionSide::Short => (2, 1),
        };

        let place = |price: Decimal, trigger_type: u8| {
            json!({
                "symbol": symbol,
                "vol": request.quantity.to_string(),
                "side": close_side,
                "openType": 2,
                "triggerPrice": price.round_dp(2).to_string(),
                "triggerType": trigger_type,
                "executeCycle": 1,
                "orderType": 5,
                "trend": 1,
            })
        };

        if let Some(tp) = request.tp_price {
            let id: serde_json::Value = self
                .contract_post(cred, "/api/v1/private/planorder/place", &place(tp, tp_trigger))
                .await?;
            ack.tp_order_id = Some(id.to_string().trim_matches('"').to_string());
        }
        if let Some(sl) = request.sl_price {
            let id: serde_json::Value = self
                .contract_post(cred, "/api/v1/private/planorder/place", &place(sl, sl_trigger))
                .await?;
            ack.sl_order_id = Some(id.to_string().trim_matches('"').to_string());
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
                exchange: Exchange::Mexc,
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
            let body = json!({ "symbol": Self::contract_symbol(symbol) });
            self.contract_post::<serde_json::Value>(cred, "/api/v1/private/order/cancel_all", &body)
                .await?;
            // Resting TP/SL triggers live in the plan-order book.
            self.contract_post::<serde_json::Value>(
                cred,
                "/api/v1/private/planorder/cancel_all",
                &body,
            )
            .await?;
        } else {
            let params = vec![("symbol", symbol.to_string())];
            self.spot_signed(cred, reqwest::Method::DELETE, "/api/v3/openOrders", params)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_symbol_mapping() {
        assert_eq!(MexcClient::contract_symbol("BTCUSDT"), "BTC_USDT");
        assert_eq!(MexcClient::contract_symbol("ETHUSDT"), "ETH_USDT");
    }

    #[test]
    fn test_contract_side_codes() {
        assert_eq!(MexcClient::contract_side(PositionSide::Long, false), 1);
        assert_eq!(MexcClient::contract_side(PositionSide::Short, false), 3);
        assert_eq!(MexcClient::contract_side(PositionSide::Short, true), 4);
        assert_eq!(MexcClient::contract_side(PositionSide::Long, true), 2);
    }

    #[test]
    fn test_contract_envelope_rejection_classified() {
        let envelope: ContractEnvelope<ContractTicker> = ContractEnvelope {
            success: false,
            code: 602,
            message: Some("Signature verification failed".to_string()),
            data: None,
        };
        let err = unwrap_contract(envelope).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }
}
