//! Idempotent trade dispatch
//!
//! Turns a [`TradeIntent`] into at most one exchange position. The unit of
//! idempotency is the client order id: the dispatcher claims it with the
//! store's conditional create *before* touching the exchange, so when two
//! dispatcher instances race on the same intent exactly one places the
//! order and the other adopts the winner's record.
//!
//! Opening is a three-phase protocol — claim the pending record, place the
//! entry order, attach protective triggers — and each phase is persisted,
//! so a crash between phases leaves a record that a later dispatch of the
//! same id can finish (a missing protective attachment is resumed, a failed
//! entry is retried).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::common::errors::{DispatchError, DispatchResult, StoreError};
use crate::common::types::{
    ExchangeCredential, OrderRequest, PlanTier, PositionSide, ProtectiveRequest, TradeIntent,
    TradeRecord, TradeStatus,
};
use crate::exchange::ExchangeOps;
use crate::store::{paths, DocumentStore};

/// A PENDING record whose last update is older than this has no live
/// dispatcher behind it; anything younger is treated as an entry in flight.
const ENTRY_RESUME_AFTER_SECONDS: i64 = 30;

/// Orchestrates order placement against the gateway and record keeping
/// against the store.
pub struct TradeDispatcher {
    gateway: Arc<dyn ExchangeOps>,
    store: Arc<dyn DocumentStore>,
}

impl TradeDispatcher {
    pub fn new(gateway: Arc<dyn ExchangeOps>, store: Arc<dyn DocumentStore>) -> Self {
        Self { gateway, store }
    }

    /// Open a position for `intent`, idempotently.
    ///
    /// Re-dispatching an id that already opened returns the existing record
    /// untouched; an id whose entry or protective phase was interrupted gets
    /// that phase finished; an id that previously failed is retried. The
    /// plan cap applies only when a new position slot is being taken.
    #[instrument(skip(self, intent), fields(user = %intent.user_id, symbol = %intent.symbol))]
    pub async fn dispatch(&self, intent: TradeIntent) -> DispatchResult<TradeRecord> {
        let cred = self.credentials(&intent.user_id, intent.exchange).await?;

        let client_order_id = intent
            .client_order_id
            .clone()
            .unwrap_or_else(|| derived_client_order_id(&intent.user_id, &intent.symbol, Utc::now()));
        let path = paths::trade(&intent.user_id, &client_order_id);

        let now = Utc::now();
        let mut record = TradeRecord {
            client_order_id: client_order_id.clone(),
            user_id: intent.user_id.clone(),
            exchange: intent.exchange,
            symbol: intent.symbol.clone(),
            side: intent.side,
            amount: intent.amount,
            leverage: intent.leverage,
            entry_price: None,
            tp_price: None,
            sl_price: None,
            exchange_order_id: None,
            tp_order_id: None,
            sl_order_id: None,
            status: TradeStatus::Pending,
            realized_pnl: None,
            created_at: now,
            updated_at: now,
        };

        // The idempotency lookup comes before any plan accounting: a
        // re-dispatched id must be answered from its existing record, which
        // would otherwise count against the very cap being checked.
        match self.load::<TradeRecord>(&path).await? {
            Some(existing) => match existing.status {
                // A failed entry never opened a position; reclaim the id.
                TradeStatus::Failed => {
                    self.ensure_capacity(&intent.user_id).await?;
                    info!(client_order_id = %client_order_id, "retrying previously failed dispatch");
                    self.store.set(&path, to_doc(&record)?).await?;
                }
                // A stale claim with no entry order behind it was left by a
                // crashed dispatcher; take its entry phase over. Its slot is
                // already counted, so the cap is not re-checked.
                TradeStatus::Pending
                    if existing.exchange_order_id.is_none()
                        && (now - existing.updated_at).num_seconds() >= ENTRY_RESUME_AFTER_SECONDS =>
                {
                    info!(client_order_id = %client_order_id, "resuming abandoned entry");
                    record = existing;
                    record.updated_at = now;
                    self.store.set(&path, to_doc(&record)?).await?;
                }
                _ if existing.missing_protective() => {
                    return self.resume_protective(&cred, existing).await;
                }
                _ => {
                    info!(client_order_id = %client_order_id, "dispatch already handled, returning existing record");
                    return Ok(existing);
                }
            },
            None => {
                self.ensure_capacity(&intent.user_id).await?;
                let claimed = self
                    .store
                    .conditional_create(&path, to_doc(&record)?)
                    .await?;
                if !claimed {
                    // Lost the claim race; the winner's entry is in flight.
                    let existing: TradeRecord = self
                        .load(&path)
                        .await?
                        .ok_or_else(|| DispatchError::TradeNotFound(client_order_id.clone()))?;
                    info!(client_order_id = %client_order_id, "dispatch already handled, returning existing record");
                    return Ok(existing);
                }
            }
        }

        // Phase two: the entry order. Failure here leaves no position, so
        // the record is marked failed and the id stays retryable.
        let order = OrderRequest {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.amount,
            leverage: intent.leverage,
            reduce_only: false,
        };
        let ack = match self.gateway.place_order(&cred, &order).await {
            Ok(ack) => ack,
            Err(err) => {
                record.status = TradeStatus::Failed;
                record.updated_at = Utc::now();
                self.store.set(&path, to_doc(&record)?).await?;
                return Err(DispatchError::DispatchFailed(err));
            }
        };

        let entry_price = match ack.avg_price {
            Some(price) => price,
            None => {
                self.gateway
                    .get_current_price(&cred, &intent.symbol)
                    .await?
            }
        };
        let (tp_price, sl_price) =
            protective_prices(intent.side, entry_price, intent.tp_pct, intent.sl_pct);

        record.status = TradeStatus::Open;
        record.entry_price = Some(entry_price);
        record.exchange_order_id = Some(ack.order_id);
        record.tp_price = tp_price;
        record.sl_price = sl_price;
        record.updated_at = Utc::now();
        self.store.set(&path, to_doc(&record)?).await?;
        info!(client_order_id = %client_order_id, entry = %entry_price, "position opened");

        if tp_price.is_some() || sl_price.is_some() {
            return self.resume_protective(&cred, record).await;
        }
        Ok(record)
    }

    /// Attach TP/SL triggers for an open record that doesn't have them yet.
    ///
    /// On failure the position stays open and unprotected; that state is
    /// deliberately preserved in the record so a later dispatch of the same
    /// id (or an operator) can finish the attachment.
    async fn resume_protective(
        &self,
        cred: &ExchangeCredential,
        mut record: TradeRecord,
    ) -> DispatchResult<TradeRecord> {
        let request = ProtectiveRequest {
            symbol: record.symbol.clone(),
            side: record.side,
            quantity: record.amount,
            tp_price: record.tp_price,
            sl_price: record.sl_price,
        };

        match self.gateway.attach_protective(cred, &request).await {
            Ok(ack) => {
                record.tp_order_id = ack.tp_order_id;
                record.sl_order_id = ack.sl_order_id;
                record.updated_at = Utc::now();
                let path = paths::trade(&record.user_id, &record.client_order_id);
                self.store.set(&path, to_doc(&record)?).await?;
                Ok(record)
            }
            Err(err) => {
                error!(
                    client_order_id = %record.client_order_id,
                    error = %err,
                    "position is open without protective orders"
                );
                Err(DispatchError::ProtectiveOrderFailed {
                    client_order_id: record.client_order_id.clone(),
                    source: err,
                })
            }
        }
    }

    /// Close the position behind `client_order_id` and record realized P&L.
    ///
    /// Closing an already-closed (or failed) record is a no-op that returns
    /// the record as stored.
    #[instrument(skip(self), fields(user = %user_id))]
    pub async fn close(
        &self,
        user_id: &str,
        client_order_id: &str,
    ) -> DispatchResult<TradeRecord> {
        let path = paths::trade(user_id, client_order_id);
        let mut record: TradeRecord = self
            .load(&path)
            .await?
            .ok_or_else(|| DispatchError::TradeNotFound(client_order_id.to_string()))?;

        match record.status {
            TradeStatus::Closed | TradeStatus::Failed => return Ok(record),
            TradeStatus::Pending | TradeStatus::Open => {}
        }

        let cred = self.credentials(user_id, record.exchange).await?;
        let ack = self.gateway.close_position(&cred, &record.symbol).await?;

        let exit_price = match ack.avg_price {
            Some(price) => price,
            None => {
                self.gateway
                    .get_current_price(&cred, &record.symbol)
                    .await?
            }
        };

        record.realized_pnl = record
            .entry_price
            .map(|entry| realized_pnl(record.side, entry, exit_price, record.amount));
        record.status = TradeStatus::Closed;
        record.updated_at = Utc::now();
        self.store.set(&path, to_doc(&record)?).await?;
        info!(
            client_order_id = %client_order_id,
            pnl = ?record.realized_pnl,
            "position closed"
        );
        Ok(record)
    }

    /// All trade records for a user, newest first
    pub async fn list_trades(&self, user_id: &str) -> DispatchResult<Vec<TradeRecord>> {
        let Some(value) = self.store.get(&paths::trades(user_id)).await? else {
            return Ok(Vec::new());
        };
        let Some(map) = value.as_object() else {
            return Ok(Vec::new());
        };

        let mut trades = Vec::with_capacity(map.len());
        for doc in map.values() {
            trades.push(from_doc::<TradeRecord>(doc.clone())?);
        }
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    /// Enforce the plan's open-position cap before a new slot is taken.
    async fn ensure_capacity(&self, user_id: &str) -> DispatchResult<()> {
        let plan = self.plan(user_id).await?;
        let active = self.count_active(user_id).await?;
        if active >= plan.max_open_positions() {
            return Err(DispatchError::LimitExceeded {
                current: active,
                max: plan.max_open_positions(),
            });
        }
        Ok(())
    }

    /// Pending and open records both count against the plan cap: a pending
    /// record is an entry order in flight.
    async fn count_active(&self, user_id: &str) -> DispatchResult<usize> {
        Ok(self
            .list_trades(user_id)
            .await?
            .iter()
            .filter(|t| matches!(t.status, TradeStatus::Pending | TradeStatus::Open))
            .count())
    }

    async fn credentials(
        &self,
        user_id: &str,
        exchange: crate::common::types::Exchange,
    ) -> DispatchResult<ExchangeCredential> {
        match self.store.get(&paths::credentials(user_id, exchange)).await? {
            Some(value) => Ok(from_doc(value)?),
            None => Err(DispatchError::CredentialsMissing { exchange }),
        }
    }

    async fn plan(&self, user_id: &str) -> DispatchResult<PlanTier> {
        match self.store.get(&paths::plan(user_id)).await? {
            Some(value) => Ok(from_doc(value)?),
            None => Ok(PlanTier::default()),
        }
    }

    async fn load<T: DeserializeOwned>(&self, path: &str) -> DispatchResult<Option<T>> {
        match self.store.get(path).await? {
            Some(value) => Ok(Some(from_doc(value)?)),
            None => Ok(None),
        }
    }
}

fn to_doc<T: serde::Serialize>(value: &T) -> DispatchResult<Value> {
    serde_json::to_value(value).map_err(|e| DispatchError::Store(StoreError::Serialization(e)))
}

fn from_doc<T: DeserializeOwned>(value: Value) -> DispatchResult<T> {
    serde_json::from_value(value).map_err(|e| DispatchError::Store(StoreError::Serialization(e)))
}

/// Deterministic id for auto-trades: one per (user, symbol, minute), so
/// however many dispatcher instances see the same signal they derive the
/// same id and the store picks a single winner.
pub fn derived_client_order_id(user_id: &str, symbol: &str, at: DateTime<Utc>) -> String {
    let bucket = at.timestamp() - at.timestamp().rem_euclid(60);
    format!("{}-{}-{}", user_id, symbol, bucket)
}

/// TP/SL trigger prices from the entry price and percentage distances.
/// A zero (or negative) percentage disables that trigger.
pub fn protective_prices(
    side: PositionSide,
    entry: Decimal,
    tp_pct: Decimal,
    sl_pct: Decimal,
) -> (Option<Decimal>, Option<Decimal>) {
    let hundred = Decimal::ONE_HUNDRED;
    let tp = (tp_pct > Decimal::ZERO).then(|| match side {
        PositionSide::Long => entry * (Decimal::ONE + tp_pct / hundred),
        PositionSide::Short => entry * (Decimal::ONE - tp_pct / hundred),
    });
    let sl = (sl_pct > Decimal::ZERO).then(|| match side {
        PositionSide::Long => entry * (Decimal::ONE - sl_pct / hundred),
        PositionSide::Short => entry * (Decimal::ONE + sl_pct / hundred),
    });
    (tp, sl)
}

/// Realized P&L of a closed position: absolute price move times the
/// traded quantity, signed by side.
pub fn realized_pnl(side: PositionSide, entry: Decimal, exit: Decimal, quantity: Decimal) -> Decimal {
    let move_per_unit = match side {
        PositionSide::Long => exit - entry,
        PositionSide::Short => entry - exit,
    };
    move_per_unit * quantity
}
