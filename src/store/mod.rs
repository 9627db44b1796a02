//! Persistent document-store contract.
//!
//! The core consumes its long-term store only through this small trait:
//! read/write/conditional-create by key path. `conditional_create` is what
//! makes dispatch idempotency correct without a distributed lock — multiple
//! dispatcher instances may run concurrently and the store arbitrates who
//! owns a given client order id.

use async_trait::async_trait;
use serde_json::Value;

use crate::common::errors::StoreResult;
use crate::common::types::Exchange;

mod memory;

pub use memory::InMemoryStore;

/// Document store consumed by the dispatcher, detector and pipeline.
///
/// Paths are `/`-separated and address a nested document tree; `get` on an
/// interior path returns the whole subtree.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document (or subtree) at `path`, `None` when absent
    async fn get(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Write the document at `path`, creating intermediate nodes
    async fn set(&self, path: &str, doc: Value) -> StoreResult<()>;

    /// Atomically create the document at `path` only if nothing exists
    /// there. Returns `false` when the path was already occupied.
    async fn conditional_create(&self, path: &str, doc: Value) -> StoreResult<bool>;
}

/// Key-path builders for everything the core persists
pub mod paths {
    use super::Exchange;

    /// One trade record, keyed by client order id
    pub fn trade(user_id: &str, client_order_id: &str) -> String {
        format!("trades/{}/{}", user_id, client_order_id)
    }

    /// All trade records for a user
    pub fn trades(user_id: &str) -> String {
        format!("trades/{}", user_id)
    }

    /// Exchange API credentials for one (user, exchange) pair
    pub fn credentials(user_id: &str, exchange: Exchange) -> String {
        format!("credentials/{}/{}", user_id, exchange)
    }

    /// Subscription tier of a user
    pub fn plan(user_id: &str) -> String {
        format!("users/{}/plan", user_id)
    }

    /// Auto-trading settings of a user
    pub fn auto_trading(user_id: &str) -> String {
        format!("users/{}/auto_trading", user_id)
    }

    /// Append-only signal audit trail entry
    pub fn signal(user_id: &str, detected_at_ms: i64) -> String {
        format!("signals/{}/{}", user_id, detected_at_ms)
    }

    /// Last computed EMA pair for a detector key, written through for
    /// observability
    pub fn ema_cache(user_id: &str, exchange: Exchange, symbol: &str, interval: &str) -> String {
        format!("ema_cache/{}/{}/{}/{}", user_id, exchange, symbol, interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_shapes() {
        assert_eq!(paths::trade("u1", "c1"), "trades/u1/c1");
        assert_eq!(paths::credentials("u1", Exchange::Okx), "credentials/u1/okx");
        assert_eq!(paths::plan("u1"), "users/u1/plan");
        assert_eq!(
            paths::ema_cache("u1", Exchange::Binance, "BTCUSDT", "15m"),
            "ema_cache/u1/binance/BTCUSDT/15m"
        );
    }
}
