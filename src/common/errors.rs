//! Error types for the application

use thiserror::Error;

use super::types::Exchange;

/// Result type alias for exchange gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Result type alias for persistent store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for trade dispatch operations
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Normalized error taxonomy for all exchange operations.
///
/// Every per-exchange client maps its own HTTP status and JSON error
/// conventions into one of these kinds so callers never branch on
/// exchange-specific codes.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad or expired credentials. Never retried.
    #[error("[{exchange}] authentication failed: {message}")]
    Authentication { exchange: Exchange, message: String },

    /// 429-equivalent. Retried with backoff.
    #[error("[{exchange}] rate limit exceeded: {message}")]
    RateLimit { exchange: Exchange, message: String },

    /// Not enough balance for the operation. Not retried, surfaced to user.
    #[error("[{exchange}] insufficient balance: {message}")]
    InsufficientBalance { exchange: Exchange, message: String },

    /// Timeouts, connection failures, 5xx. Retried up to the policy limit.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Unmapped exchange-side rejection, surfaced verbatim for diagnostics.
    /// Not retried.
    #[error("[{exchange}] exchange error: {message}")]
    Exchange { exchange: Exchange, message: String },

    /// Malformed response body (unparseable JSON, missing fields)
    #[error("invalid API response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the retry wrapper may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimit { .. } | GatewayError::TransientNetwork(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            // Timeouts, DNS, connect and send failures all retry the same way.
            GatewayError::TransientNetwork(err.to_string())
        }
    }
}

/// Errors from the document-store collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    /// Document failed to serialize/deserialize
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-level failure (connectivity, permissions)
    #[error("store backend error: {0}")]
    Backend(String),

    /// Path is empty or otherwise malformed
    #[error("invalid store path: {0}")]
    InvalidPath(String),
}

/// Errors surfaced by the trade dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Open-position count is at or above the user's plan cap
    #[error("plan limit reached: {current} open position(s), plan allows {max}")]
    LimitExceeded { current: usize, max: usize },

    /// No stored credentials for (user, exchange)
    #[error("no API credentials configured for {exchange}")]
    CredentialsMissing { exchange: Exchange },

    /// Order placement failed; no position was opened, safe to retry
    /// with the same client order id.
    #[error("order placement failed: {0}")]
    DispatchFailed(#[source] GatewayError),

    /// The position opened but TP/SL attachment failed. The position is
    /// real and remains open without protection; high severity.
    #[error("position {client_order_id} is open without protective orders: {source}")]
    ProtectiveOrderFailed {
        client_order_id: String,
        #[source]
        source: GatewayError,
    },

    /// Close/resume target does not exist
    #[error("trade not found: {0}")]
    TradeNotFound(String),

    /// Pre-order gateway failure (price fetch, position listing)
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Persistent store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the real-time feed transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket handshake or connection errors
    #[error("WebSocket connection error: {0}")]
    Connection(String),

    /// WebSocket send/receive errors
    #[error("WebSocket communication error: {0}")]
    Communication(String),

    /// TCP listener errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Communication(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}
