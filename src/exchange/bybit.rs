//! Bybit v5 client
//!
//! One host for spot and derivatives; the `category` query parameter picks
//! the market. Signs with HMAC-SHA256 hex over
//! `timestamp + api_key + recv_window + payload`, where the payload is the
//! query string on GET and the JSON body on POST. Application-level
//! rejections arrive inside a 200 response as a non-zero `retCode`.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::http::{check_response, classify_body};
use super::sign::hmac_sha256_hex;
use super::ExchangeApi;
use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::{
    Balance, Candle, Exchange, ExchangeCredential, OrderAck, OrderRequest, Position,
    PositionSide, ProtectiveAck, ProtectiveRequest,
};

const BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";

/// Bybit REST client
#[derive(Debug, Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
}

/// Every v5 endpoint wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V5Response<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    wallet_balance: Decimal,
    #[serde(default)]
    available_to_withdraw: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    last_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    symbol: String,
    side: String,
    size: Decimal,
    avg_price: Decimal,
    mark_price: Decimal,
    unrealised_pnl: Decimal,
    leverage: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    order_id: String,
}

impl BybitClient {
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

    fn category(cred: &ExchangeCredential) -> &'static str {
        if cred.is_futures {
            "linear"
        } else {
            "spot"
        }
    }

    /// Bybit intervals are bare minute counts plus D/W/M letters.
    fn map_interval(interval: &str) -> String {
        match interval {
            "1m" => "1".to_string(),
            "3m" => "3".to_string(),
            "5m" => "5".to_string(),
            "15m" => "15".to_string(),
            "30m" => "30".to_string(),
            "1h" => "60".to_string(),
            "2h" => "120".to_string(),
            "4h" => "240".to_string(),
            "1d" => "D".to_string(),
            "1w" => "W".to_string(),
            other => other.to_string(),
        }
    }

    fn auth_headers(
        &self,
        cred: &ExchangeCredential,
        payload: &str,
    ) -> GatewayResult<[(&'static str, String); 4]> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let message = format!("{}{}{}{}", timestamp, cred.api_key, RECV_WINDOW, payload);
        let signature = hmac_sha256_hex(Exchange::Bybit, &cred.api_secret, &message)?;
        Ok([
            ("X-BAPI-API-KEY", cred.api_key.clone()),
            ("X-BAPI-SIGN", signature),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
        ])
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        path: &str,
        query: &str,
    ) -> GatewayResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut request = self.client.get(&url);
        for (name, value) in self.auth_headers(cred, query)? {
            request = request.header(name, value);
        }
        let response = check_response(Exchange::Bybit, request.send().await?).await?;
        unwrap_envelope(response.json::<V5Response<T>>().await?)
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        cred: &ExchangeCredential,
        path: &str,
        body: &serde_json::Value,
    ) -> GatewayResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let payload = body.to_string();
        let mut request = self.client.post(&url);
        for (name, value) in self.auth_headers(cred, &payload)? {
            request = request.header(name, value);
        }
        let response = check_response(
            Exchange::Bybit,
            request
                .header("Content-Type", "application/json")
                .body(payload)
                .send()
                .await?,
        )
        .await?;
        unwrap_envelope(response.json::<V5Response<T>>().await?)
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> GatewayResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = check_response(Exchange::Bybit, self.client.get(&url).send().await?).await?;
        unwrap_envelope(response.json::<V5Response<T>>().await?)
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "Buy",
            PositionSide::Short => "Sell",
        }
    }
}

fn unwrap_envelope<T>(envelope: V5Response<T>) -> GatewayResult<T> {
    if envelope.ret_code != 0 {
        return Err(classify_body(
            Exchange::Bybit,
            &format!("retCode {}: {}", envelope.ret_code, envelope.ret_msg),
        ));
    }
    envelope
        .result
        .ok_or_else(|| GatewayError::InvalidResponse("missing result field".into()))
}

#[async_trait]
impl ExchangeApi for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn get_balance(&self, cred: &ExchangeCredential) -> GatewayResult<Balance> {
        let result: ListResult<WalletAccount> = self
            .signed_get(cred, "/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let usdt = result
            .list
            .into_iter()
            .next()
            .and_then(|account| account.coin.into_iter().find(|c| c.coin == "USDT"));
        let (total, available) = match usdt {
            Some(coin) => {
                let available = coin.available_to_withdraw.unwrap_or(coin.wallet_balance);
                (coin.wallet_balance, available)
            }
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        Ok(Balance {
            exchange: Exchange::Bybit,
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
        let query = format!("category={}&symbol={}", Self::category(cred), symbol);
        let result: ListResult<Ticker> = self.public_get("/v5/market/tickers", &query).await?;
        result
            .list
            .into_iter()
            .next()
            .map(|t| t.last_price)
            .ok_or_else(|| GatewayError::InvalidResponse(format!("no ticker for {}", symbol)))
    }

    async fn get_positions(&self, cred: &ExchangeCredential) -> GatewayResult<Vec<Position>> {
        if !cred.is_futures {
            return Ok(Vec::new());
        }

        let result: ListResult<PositionEntry> = self
            .signed_get(
                cred,
                "/v5/position/list",
                "category=linear&settleCoin=USDT",
            )
            .await?;

        Ok(result
            .list
            .into_iter()
            .filter(|p| !p.size.is_zero())
            .map(|p| Position {
                exchange: Exchange::Bybit,
                symbol: p.symbol,
                side: if p.side == "Buy" {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                amount: p.size,
                entry_price: p.avg_price,
                current_price: p.mark_price,
                unrealized_pnl: p.unrealised_pnl,
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
        let query = format!(
            "category={}&symbol={}&interval={}&limit={}",
            Self::category(cred),
            symbol,
            Self::map_interval(interval),
            limit
        );
        // Rows are positional string arrays, newest first.
        let result: ListResult<Vec<String>> = self.public_get("/v5/market/kline", &query).await?;

        let mut candles: Vec<Candle> = result
            .list
            .into_iter()
            .map(|row| {
                let open_time_ms = row
                    .first()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| GatewayError::InvalidResponse("kline missing start time".into()))?;
                let close = row
                    .get(4)
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| GatewayError::InvalidResponse("kline missing close".into()))?;
                let open_time = Utc
                    .timestamp_millis_opt(open_time_ms)
                    .single()
                    .ok_or_else(|| GatewayError::InvalidResponse("kline start time out of range".into()))?;
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
        if cred.is_futures && !request.reduce_only {
            let leverage = request.leverage.to_string();
            let body = json!({
                "category": "linear",
                "symbol": request.symbol,
                "buyLeverage": leverage,
                "sellLeverage": leverage,
            });
            // Bybit rejects a set-leverage that matches the current value;
            // neither that nor any other leverage failure should block entry.
            if let Err(err) = self
                .signed_post::<serde_json::Value>(cred, "/v5/position/set-leverage", &body)
                .await
            {
                warn!(symbol = %request.symbol, error = %err, "failed to set leverage");
            }
        }

        let mut body = json!({
            "category": Self::category(cred),
            "symbol": request.symbol,
            "side": Self::order_side(request.side),
            "orderType": "Market",
            "qty": request.quantity.to_string(),
        });
        if request.reduce_only && cred.is_futures {
            body["reduceOnly"] = json!(true);
        }

        let result: OrderResult = self.signed_post(cred, "/v5/order/create", &body).await?;
        Ok(OrderAck {
            order_id: result.order_id,
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
        // Bybit attaches TP/SL to the position itself rather than as
        // standalone orders, so there are no separate order ids to record.
        let mut body = json!({
            "category": "linear",
            "symbol": request.symbol,
            "positionIdx": 0,
        });
        if let Some(tp) = request.tp_price {
            body["takeProfit"] = json!(tp.round_dp(2).to_string());
        }
        if let Some(sl) = request.sl_price {
            body["stopLoss"] = json!(sl.round_dp(2).to_string());
        }

        self.signed_post::<serde_json::Value>(cred, "/v5/position/trading-stop", &body)
            .await?;
        Ok(ProtectiveAck::default())
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
                exchange: Exchange::Bybit,
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
        let body = json!({
            "category": Self::category(cred),
            "symbol": symbol,
        });
        self.signed_post::<serde_json::Value>(cred, "/v5/order/cancel-all", &body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_mapping() {
        assert_eq!(BybitClient::map_interval("1h"), "60");
        assert_eq!(BybitClient::map_interval("15m"), "15");
        assert_eq!(BybitClient::map_interval("1d"), "D");
    }

    #[test]
    fn test_envelope_rejection_classified() {
        let envelope: V5Response<ListResult<Ticker>> = V5Response {
            ret_code: 10003,
            ret_msg: "Invalid API key".to_string(),
            result: None,
        };
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }
}
