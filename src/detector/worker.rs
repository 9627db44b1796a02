//! Polling worker for one monitored candle stream

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::ema::{EmaPair, EmaUpdate};
use super::{DetectorEvent, DetectorKey};
use crate::common::types::{Candle, ExchangeCredential, Signal};
use crate::config::types::DetectorConfig;
use crate::exchange::ExchangeOps;

/// Polls candle history for one stream and turns crossovers into events.
///
/// The EMA state never resets once seeded: a failed poll is reported and
/// skipped, and only candles newer than the last processed open time are
/// fed in, so a backlog after downtime replays in order without
/// double-counting.
pub struct DetectorWorker {
    key: DetectorKey,
    cred: ExchangeCredential,
    gateway: Arc<dyn ExchangeOps>,
    config: DetectorConfig,
    events: mpsc::Sender<DetectorEvent>,
    pair: EmaPair,
    last_open_time: Option<chrono::DateTime<Utc>>,
}

impl DetectorWorker {
    pub fn new(
        key: DetectorKey,
        cred: ExchangeCredential,
        gateway: Arc<dyn ExchangeOps>,
        config: DetectorConfig,
        events: mpsc::Sender<DetectorEvent>,
    ) -> Self {
        let pair = EmaPair::new(config.fast_period, config.slow_period);
        Self {
            key,
            cred,
            gateway,
            config,
            events,
            pair,
            last_open_time: None,
        }
    }

    /// Poll loop. Returns when the event channel closes.
    pub async fn run(mut self) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.poll_once().await {
                return;
            }
        }
    }

    /// One poll. Returns false once the pipeline has shut down.
    async fn poll_once(&mut self) -> bool {
        let candles = match self
            .gateway
            .get_candles(
                &self.cred,
                &self.key.symbol,
                &self.key.interval,
                self.config.candle_limit,
            )
            .await
        {
            Ok(candles) => candles,
            Err(err) => {
                warn!(key = %self.key, error = %err, "candle poll failed");
                let event = DetectorEvent::FetchFailed {
                    key: self.key.clone(),
                    error: err.to_string(),
                };
                return self.events.send(event).await.is_ok();
            }
        };

        // The newest row is the still-forming candle; everything before it
        // is closed.
        let closed = match candles.split_last() {
            Some((_, closed)) => closed,
            None => return true,
        };

        if self.last_open_time.is_none() {
            // First successful poll: rebuild state from history without
            // re-announcing crossovers that already happened.
            let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
            self.pair.warmup(&closes);
            self.last_open_time = closed.last().map(|c| c.open_time);
            debug!(key = %self.key, candles = closed.len(), "seeded from history");
            return true;
        }

        for candle in closed {
            if Some(candle.open_time) <= self.last_open_time {
                continue;
            }
            if !self.process_candle(candle).await {
                return false;
            }
            self.last_open_time = Some(candle.open_time);
        }
        true
    }

    async fn process_candle(&mut self, candle: &Candle) -> bool {
        let update = self.pair.update(candle.close);
        let (fast, slow, crossover) = match update {
            EmaUpdate::Tracking {
                fast,
                slow,
                crossover,
            } => (fast, slow, crossover),
            EmaUpdate::Seeding { .. } => return true,
        };

        let Some(signal_type) = crossover else {
            return true;
        };

        let signal = Signal {
            user_id: self.key.user_id.clone(),
            exchange: self.key.exchange,
            symbol: self.key.symbol.clone(),
            interval: self.key.interval.clone(),
            signal_type,
            ema_fast: fast,
            ema_slow: slow,
            price: candle.close,
            detected_at: Utc::now(),
        };
        debug!(key = %self.key, signal = %signal_type, price = candle.close, "crossover detected");
        self.events
            .send(DetectorEvent::Signal(signal))
            .await
            .is_ok()
    }
}
