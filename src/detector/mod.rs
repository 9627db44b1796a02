//! Signal detection: per-stream EMA crossover polling
//!
//! One worker task per monitored (user, exchange, symbol, interval) stream,
//! registered with the [`SignalMonitor`]. Workers poll candle history
//! through the gateway, feed closed candles into an [`EmaPair`] and push
//! [`DetectorEvent`]s into the shared pipeline channel.

use crate::common::types::{Exchange, Signal};

pub mod ema;
pub mod monitor;
pub mod worker;

pub use ema::{EmaPair, EmaUpdate};
pub use monitor::SignalMonitor;
pub use worker::DetectorWorker;

/// Identity of one monitored candle stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectorKey {
    pub user_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for DetectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.user_id, self.exchange, self.symbol, self.interval
        )
    }
}

/// What the detector workers emit into the pipeline
#[derive(Debug, Clone)]
pub enum DetectorEvent {
    /// A crossover on a monitored stream
    Signal(Signal),
    /// A poll failed; the worker stays alive and tries again next tick
    FetchFailed { key: DetectorKey, error: String },
}
