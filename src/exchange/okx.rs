//! OKX v5 client
//!
//! Signs with base64-encoded HMAC-SHA256 over
//! `timestamp + method + request_path + body`, with an ISO-8601
//! millisecond timestamp, and requires the API passphrase as a fourth
//! header. Instruments use dash-separated ids (`BTC-USDT`, `BTC-USDT-SWAP`)
//! instead of the compact symbols the rest of the system speaks.

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
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

const BASE_URL: &str = "https://www.okx.com";

/// OKX REST client
#[derive(Debug, Clone)]
pub struct OkxClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    msg: String,
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    eq: Decimal,
    avail_bal: Decimal,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    last: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    inst_id: String,
    pos: Decimal,
    avg_px: Decimal,
    mark_px: Decimal,
    upl: Decimal,
    lever: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    ord_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoOrderData {
    algo_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrder {
    inst_id: String,
    ord_id: String,
}

impl OkxClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// `BTCUSDT` becomes `BTC-USDT`, plus a `-SWAP` suffix for perpetuals.
    fn inst_id(symbol: &str, is_futures: bool) -> String {
        let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
        if is_futures {
            format!("{}-USDT-SWAP", base)
        } else {
            format!("{}-USDT", base)
        }
    }

    /// OKX uses upper-case letters for hour-and-above bars.
    fn map_bar(interval: &str) -> String {
        match interval {
            "1h" => "1H".to_string(),
            "2h" => "2H".to_string(),
            "4h" => "4H".to_string(),
            "1d" => "1D".to_string(),
            "1w" => "1W".to_string(),
            other => other.to_string(),
        }
    }

    fn td_mode(cred: &ExchangeCredential) -> &'static str {
        if cred.is_futures {
            "cross"
        } else {
            "cash"
        }
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        method: &str,
        request_path: &str,
        body: Option<&serde_json::Value>,
    ) -> GatewayResult<Vec<T>> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let message = format!("{}{}{}{}", timestamp, method, request_path, body_text);
        let signature = hmac_sha256_base64(Exchange::Okx, &cred.api_secret, &message)?;
        let passphrase = cred.passphrase.as_deref().ok_or_else(|| {
            GatewayError::Authentication {
                exchange: Exchange::Okx,
                message: "credential is missing the API passphrase".to_string(),
            }
        })?;

        let url = format!("{}{}", self.base_url, request_path);
        let mut request = match method {
            "POST" => self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body_text),
            _ => self.client.get(&url),
        };
        request = request
            .header("OK-ACCESS-KEY", &cred.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase);

        let response = check_response(Exchange::Okx, request.send().await?).await?;
        unwrap_envelope(response.json::<OkxResponse<T>>().await?)
    }

    async fn public_get<T: DeserializeOwned>(&self, request_path: &str) -> GatewayResult<Vec<T>> {
        let url = format!("{}{}", self.base_url, request_path);
        let response = check_response(Exchange::Okx, self.client.get(&url).send().await?).await?;
        unwrap_envelope(response.json::<OkxResponse<T>>().await?)
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "buy",
            PositionSide::Short => "sell",
        }
    }

    /// One-sided conditional algo order (TP or SL) triggering a market fill.
    async fn place_algo_trigger(
        &self,
        cred: &ExchangeCredential,
        request: &ProtectiveRequest,
        trigger_key: &str,
        price_key: &str,
        trigger_price: Decimal,
    ) -> GatewayResult<String> {
        let body = json!({
            "instId": Self::inst_id(&request.symbol, cred.is_futures),
            "tdMode": Self::td_mode(cred),
            "side": Self::order_side(request.side.opposite()),
            "ordType": "conditional",
            "sz": request.quantity.to_string(),
            trigger_key: trigger_price.round_dp(2).to_string(),
            price_key: "-1",
            "reduceOnly": true,
        });
        let mut data: Vec<AlgoOrderData> = self
            .signed_request(cred, "POST", "/api/v5/trade/order-algo", Some(&body))
            .await?;
        data.pop()
            .map(|d| d.algo_id)
            .ok_or_else(|| GatewayError::InvalidResponse("empty algo order response".into()))
    }
}

fn unwrap_envelope<T>(envelope: OkxResponse<T>) -> GatewayResult<Vec<T>> {
    if envelope.code != "0" {
        return Err(classify_body(
            Exchange::Okx,
            &format!("code {}: {}", envelope.code, envelope.msg),
        ));
    }
    Ok(envelope.data)
}

#[async_trait]
impl ExchangeApi for OkxClient {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        let data: Vec<BalanceData> = self
            .signed_request(cred, "GET", "/api/v5/account/balance", None)
            .await?;

        let usdt = data
            .into_iter()
            .next()
            .and_then(|d| d.details.into_iter().find(|c| c.ccy == "USDT"));
        let (total, available) = usdt.map(|c| (c.eq, c.avail_bal)).unwrap_or_default();

        Ok(Balance {
            exchange: Exchange::Okx,
            currency: "USDT".to_string(),
            total,
            available,
            locked: total - available,
            timestamp: Utc::now(),
        })
    }

    async fn get_current_price(
        &self,
        cred: &ExchangeCredential,
        symbol: &str,
    ) -> GatewayResult<Decimal> {
        let path = format!(
            "/api/v5/market/ticker?instId={}",
            Self::inst_id(symbol, cred.is_futures)
        );
        let data: Vec<Ticker> = self.public_get(&path).await?;
        data.into_iter()
            .next()
            .map(|t| t.last)
            .ok_or_else(|| GatewayError::InvalidResponse(format!("no ticker for {}", symbol)))
    }

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        if !cred.is_futures {
            return Ok(Vec::new());
        }

        let data: Vec<PositionData> = self
            .signed_request(cred, "GET", "/api/v5/account/positions", None)
            .await?;

        Ok(data
            .into_iter()
            .filter(|p| !p.pos.is_zero())
            .map(|p| Position {
                exchange: Exchange::Okx,
                // Strip back down to the compact form the system uses.
                symbol: p.inst_id.replace("-USDT-SWAP", "USDT").replace("-USDT", "USDT"),
                side: if p.pos > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                amount: p.pos.abs(),
                entry_price: p.avg_px,
                current_price: p.mark_px,
                unrealized_pnl: p.upl,
                leverage: super::to_leverage(p.lever),
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
        let path = format!(
            "/api/v5/market/candles?instId={}&bar={}&limit={}",
            Self::inst_id(symbol, cred.is_futures),
            Self::map_bar(interval),
            limit
        );
        // Rows are positional string arrays, newest first.
        let rows: Vec<Vec<String>> = self.public_get(&path).await?;

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| {
                let open_time_ms = row
                    .first()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| GatewayError::InvalidResponse("candle missing timestamp".into()))?;
                let close = row
                    .get(4)
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| GatewayError::InvalidResponse("candle missing close".into()))?;
                let open_time = Utc
                    .timestamp_millis_opt(open_time_ms)
                    .single()
                    .ok_or_else(|| GatewayError::InvalidResponse("candle timestamp out of range".into()))?;
                Ok(Candle { open_time, close })
            })
            .collect::<GatewayResult<_>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn place_order(
        &self,
        cred: &ExchangeCredential,
        request: &OrderRequest,
    ) -> GatewayResult<OrderAck> {
        let inst_id = Self::inst_id(&request.symbol, cred.is_futures);

        if cred.is_futures && !request.reduce_only {
            let body = json!({
                "instId": inst_id,
                "lever": request.leverage.to_string(),
                "mgnMode": "cross",
            });
            if let Err(err) = self
                .signed_request::<serde_json::Value>(
                    cred,
                    "POST",
                    "/api/v5/account/set-leverage",
                    Some(&body),
                )
                .await
            {
                warn!(symbol = %request.symbol, error = %err, "failed to set leverage");
            }
        }

        let mut body = json!({
            "instId": inst_id,
            "tdMode": Self::td_mode(cred),
            "side": Self::order_side(request.side),
            "ordType": "market",
            "sz": request.quantity.to_string(),
        });
        if request.reduce_only && cred.is_futures {
            body["reduceOnly"] = json!(true);
        }

        let mut data: Vec<OrderData> = self
            .signed_request(cred, "POST", "/api/v5/trade/order", Some(&body))
            .await?;
        let order = data
            .pop()
            .ok_or_else(|| GatewayError::InvalidResponse("empty order response".into()))?;

        Ok(OrderAck {
            order_id: order.ord_id,
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

        if let Some(tp) = request.tp_price {
            let id = self
                .place_algo_trigger(cred, request, "tpTriggerPx", "tpOrdPx", tp)
                .await?;
            ack.tp_order_id = Some(id);
        }
        if let Some(sl) = request.sl_price {
            let id = self
                .place_algo_trigger(cred, request, "slTriggerPx", "slOrdPx", sl)
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
                exchange: Exchange::Okx,
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
        let inst_id = Self::inst_id(symbol, cred.is_futures);

        // OKX has no blanket cancel endpoint; list pending orders first.
        let path = format!("/api/v5/trade/orders-pending?instId={}", inst_id);
        let pending: Vec<PendingOrder> = self.signed_request(cred, "GET", &path, None).await?;
        if !pending.is_empty() {
            let batch: Vec<serde_json::Value> = pending
                .into_iter()
                .map(|o| json!({ "instId": o.inst_id, "ordId": o.ord_id }))
                .collect();
            self.signed_request::<serde_json::Value>(
                cred,
                "POST",
                "/api/v5/trade/cancel-batch-orders",
                Some(&json!(batch)),
            )
            .await?;
        }

        // Conditional TP/SL orders live in the algo book.
        let algo_path = format!(
            "/api/v5/trade/orders-algo-pending?ordType=conditional&instId={}",
            inst_id
        );
        let algos: Vec<AlgoOrderData> = self.signed_request(cred, "GET", &algo_path, None).await?;
        if !algos.is_empty() {
            let batch: Vec<serde_json::Value> = algos
                .into_iter()
                .map(|a| json!({ "instId": inst_id, "algoId": a.algo_id }))
                .collect();
            self.signed_request::<serde_json::Value>(
                cred,
                "POST",
                "/api/v5/trade/cancel-algos",
                Some(&json!(batch)),
            )
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inst_id_conversion() {
        assert_eq!(OkxClient::inst_id("BTCUSDT", true), "BTC-USDT-SWAP");
        assert_eq!(OkxClient::inst_id("ETHUSDT", false), "ETH-USDT");
    }

    #[test]
    fn test_bar_mapping() {
        assert_eq!(OkxClient::map_bar("1h"), "1H");
        assert_eq!(OkxClient::map_bar("15m"), "15m");
        assert_eq!(OkxClient::map_bar("1d"), "1D");
    }

    #[test]
    fn test_envelope_rejection_classified() {
        let envelope: OkxResponse<Ticker> = OkxResponse {
            code: "50111".to_string(),
            msg: "Invalid OK-ACCESS-KEY".to_string(),
            data: Vec::new(),
        };
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }
}
