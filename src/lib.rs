//! Multi-exchange EMA crossover signal engine
//!
//! The crate is organised around four cooperating components:
//!
//! - [`exchange`]: one normalized client per supported exchange behind the
//!   [`exchange::ExchangeOps`] trait, with shared retry, pacing and error
//!   mapping in the gateway layer
//! - [`detector`]: per-stream polling workers feeding candle closes into an
//!   EMA crossover state machine
//! - [`broadcast`] + [`server`]: fan-out of detected signals to WebSocket
//!   feed connections over bounded, drop-oldest queues
//! - [`dispatch`]: idempotent conversion of signals (or manual intents)
//!   into exchange positions with TP/SL protection, backed by the
//!   [`store::DocumentStore`] contract
//!
//! [`pipeline`] wires the detector output to the rest; `main.rs` owns the
//! process lifecycle.

pub mod broadcast;
pub mod common;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod exchange;
pub mod pipeline;
pub mod server;
pub mod store;

pub use broadcast::Broadcaster;
pub use common::errors::{DispatchError, GatewayError, StoreError, TransportError};
pub use common::types::{Exchange, Signal, SignalType, TradeIntent, TradeRecord};
pub use config::{load_config, AppConfig};
pub use detector::{DetectorEvent, DetectorKey, SignalMonitor};
pub use dispatch::TradeDispatcher;
pub use exchange::{ExchangeGateway, ExchangeOps};
pub use server::FeedServer;
pub use store::{DocumentStore, InMemoryStore};
