//! Unified types used across the gateway, detector, broadcaster and dispatcher

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supported exchange identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Kucoin,
    Mexc,
}

impl Exchange {
    /// All supported exchanges, in registration order
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Okx,
        Exchange::Kucoin,
        Exchange::Mexc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
            Exchange::Kucoin => "kucoin",
            Exchange::Mexc => "mexc",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            "okx" => Ok(Exchange::Okx),
            "kucoin" => Ok(Exchange::Kucoin),
            "mexc" => Ok(Exchange::Mexc),
            other => Err(format!("unsupported exchange: {}", other)),
        }
    }
}

/// Crossover signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Buy => write!(f, "BUY"),
            SignalType::Sell => write!(f, "SELL"),
        }
    }
}

/// Normalized position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Direction of the order that closes a position on this side
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// A BUY signal opens a long, a SELL signal opens a short.
    pub fn from_signal(signal: SignalType) -> PositionSide {
        match signal {
            SignalType::Buy => PositionSide::Long,
            SignalType::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Immutable crossover event emitted by the signal detector.
///
/// Never mutated after creation; consumed by the broadcaster and, when the
/// owning user has auto-trading enabled, by the trade dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub user_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: String,
    pub signal_type: SignalType,
    pub ema_fast: f64,
    pub ema_slow: f64,
    /// Close price of the candle that produced the crossover
    pub price: f64,
    pub detected_at: DateTime<Utc>,
}

/// A single closed candle as returned by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the candle, used to de-duplicate polls
    pub open_time: DateTime<Utc>,
    pub close: f64,
}

/// Normalized account balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub exchange: Exchange,
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Normalized open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
}

/// Market-order request handed to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub leverage: u32,
    /// Reduce-only orders may only shrink an existing position
    pub reduce_only: bool,
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    /// Fill price when the exchange reports one
    pub avg_price: Option<Decimal>,
}

/// TP/SL attachment request. Prices are computed by the caller from entry
/// price and percentage parameters; the gateway only places the triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveRequest {
    pub symbol: String,
    /// Side of the position being protected (triggers fire the opposite way)
    pub side: PositionSide,
    pub quantity: Decimal,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
}

/// Order ids of the placed protective triggers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveAck {
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
}

/// API credentials for one (user, exchange) pair.
///
/// Owned by the persistent store; read per dispatch call and never cached
/// beyond it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredential {
    pub exchange: Exchange,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_true")]
    pub is_futures: bool,
}

fn default_true() -> bool {
    true
}

/// Lifecycle of a trade record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Failed,
}

/// The unit of idempotency: one record per client order id.
///
/// Invariant: at most one non-failed record may exist per
/// `client_order_id`, enforced through the store's conditional create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub client_order_id: String,
    pub user_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub leverage: u32,
    pub entry_price: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub exchange_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub status: TradeStatus,
    pub realized_pnl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    /// An open record that asked for protection but carries no trigger ids
    /// was interrupted between order placement and protective attachment.
    pub fn missing_protective(&self) -> bool {
        self.status == TradeStatus::Open
            && (self.tp_price.is_some() || self.sl_price.is_some())
            && self.tp_order_id.is_none()
            && self.sl_order_id.is_none()
    }
}

/// A request to open a position, from the auto-trading path or a manual call
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub user_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub leverage: u32,
    /// Take-profit distance in percent of entry; zero disables
    pub tp_pct: Decimal,
    /// Stop-loss distance in percent of entry; zero disables
    pub sl_pct: Decimal,
    /// Supplied for manual trades; derived deterministically for auto-trades
    pub client_order_id: Option<String>,
}

/// Per-user auto-trading settings, read from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTradeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_amount")]
    pub amount: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_tp_pct")]
    pub tp_pct: Decimal,
    #[serde(default = "default_sl_pct")]
    pub sl_pct: Decimal,
}

fn default_amount() -> Decimal {
    Decimal::from(10)
}

fn default_leverage() -> u32 {
    10
}

fn default_tp_pct() -> Decimal {
    Decimal::from(5)
}

fn default_sl_pct() -> Decimal {
    Decimal::from(2)
}

impl Default for AutoTradeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            amount: default_amount(),
            leverage: default_leverage(),
            tp_pct: default_tp_pct(),
            sl_pct: default_sl_pct(),
        }
    }
}

/// Subscription tier capping concurrent open positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn max_open_positions(&self) -> usize {
        match self {
            PlanTier::Free => 1,
            PlanTier::Pro => 10,
            PlanTier::Enterprise => 50,
        }
    }
}

impl Default for PlanTier {
    fn default() -> Self {
        PlanTier::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_round_trip() {
        for exchange in Exchange::ALL {
            let parsed: Exchange = exchange.as_str().parse().unwrap();
            assert_eq!(parsed, exchange);
        }
        assert!("hyperliquid".parse::<Exchange>().is_err());
    }

    #[test]
    fn test_side_from_signal() {
        assert_eq!(PositionSide::from_signal(SignalType::Buy), PositionSide::Long);
        assert_eq!(PositionSide::from_signal(SignalType::Sell), PositionSide::Short);
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }

    #[test]
    fn test_signal_serialization() {
        let signal = Signal {
            user_id: "u1".to_string(),
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            signal_type: SignalType::Buy,
            ema_fast: 43010.5,
            ema_slow: 42995.2,
            price: 43000.0,
            detected_at: Utc::now(),
        };

        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["signal_type"], "BUY");
        assert_eq!(json["exchange"], "binance");
    }

    #[test]
    fn test_plan_caps() {
        assert_eq!(PlanTier::Free.max_open_positions(), 1);
        assert_eq!(PlanTier::Pro.max_open_positions(), 10);
        assert_eq!(PlanTier::Enterprise.max_open_positions(), 50);
    }

    #[test]
    fn test_missing_protective_detection() {
        let mut record = TradeRecord {
            client_order_id: "c1".to_string(),
            user_id: "u1".to_string(),
            exchange: Exchange::Bybit,
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            amount: Decimal::ONE,
            leverage: 10,
            entry_price: Some(Decimal::from(2000)),
            tp_price: Some(Decimal::from(2100)),
            sl_price: Some(Decimal::from(1960)),
            exchange_order_id: Some("x1".to_string()),
            tp_order_id: None,
            sl_order_id: None,
            status: TradeStatus::Open,
            realized_pnl: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(record.missing_protective());

        record.tp_order_id = Some("tp1".to_string());
        assert!(!record.missing_protective());

        record.tp_order_id = None;
        record.status = TradeStatus::Closed;
        assert!(!record.missing_protective());
    }
}
