//! EMA crossover state machine
//!
//! Two exponential moving averages over closed candles. Both are seeded
//! from a simple average once enough closes have accumulated: the fast EMA
//! takes the SMA of the first `fast_period` closes and replays the rest of
//! the seed window exponentially, the slow EMA takes the SMA of the whole
//! window. After seeding, every closed candle moves both averages and a
//! sign flip of `fast - slow` is a crossover: negative-to-positive is a
//! BUY, positive-to-negative is a SELL. A zero difference carries the
//! previous sign forward so a touch without a cross never fires.

use crate::common::types::SignalType;

/// Result of feeding one closed candle into an [`EmaPair`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmaUpdate {
    /// Still accumulating the seed window
    Seeding { remaining: usize },
    /// Both averages are live
    Tracking {
        fast: f64,
        slow: f64,
        crossover: Option<SignalType>,
    },
}

#[derive(Debug, Clone)]
enum EmaState {
    AwaitingSeed { closes: Vec<f64> },
    Tracking { fast: f64, slow: f64, prev_diff: f64 },
}

/// Fast/slow EMA pair for one (user, exchange, symbol, interval) stream
#[derive(Debug, Clone)]
pub struct EmaPair {
    fast_period: usize,
    slow_period: usize,
    state: EmaState,
}

impl EmaPair {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        debug_assert!(fast_period < slow_period);
        Self {
            fast_period,
            slow_period,
            state: EmaState::AwaitingSeed {
                closes: Vec::with_capacity(slow_period),
            },
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, EmaState::Tracking { .. })
    }

    /// Current (fast, slow) values, once seeded
    pub fn values(&self) -> Option<(f64, f64)> {
        match &self.state {
            EmaState::Tracking { fast, slow, .. } => Some((*fast, *slow)),
            EmaState::AwaitingSeed { .. } => None,
        }
    }

    /// Feed one closed candle.
    pub fn update(&mut self, close: f64) -> EmaUpdate {
        match &mut self.state {
            EmaState::AwaitingSeed { closes } => {
                closes.push(close);
                if closes.len() < self.slow_period {
                    return EmaUpdate::Seeding {
                        remaining: self.slow_period - closes.len(),
                    };
                }

                let mut fast = mean(&closes[..self.fast_period]);
                let k_fast = smoothing(self.fast_period);
                for c in &closes[self.fast_period..] {
                    fast = (c - fast) * k_fast + fast;
                }
                let slow = mean(closes);

                self.state = EmaState::Tracking {
                    fast,
                    slow,
                    prev_diff: fast - slow,
                };
                EmaUpdate::Tracking {
                    fast,
                    slow,
                    crossover: None,
                }
            }
            EmaState::Tracking {
                fast,
                slow,
                prev_diff,
            } => {
                *fast = (close - *fast) * smoothing(self.fast_period) + *fast;
                *slow = (close - *slow) * smoothing(self.slow_period) + *slow;

                let diff = *fast - *slow;
                let crossover = if *prev_diff < 0.0 && diff > 0.0 {
                    Some(SignalType::Buy)
                } else if *prev_diff > 0.0 && diff < 0.0 {
                    Some(SignalType::Sell)
                } else {
                    None
                };
                if diff != 0.0 {
                    *prev_diff = diff;
                }

                EmaUpdate::Tracking {
                    fast: *fast,
                    slow: *slow,
                    crossover,
                }
            }
        }
    }

    /// Replay historical closes without reporting crossovers. Used to
    /// rebuild state from candle history after a restart, where any
    /// crossovers already happened in the past.
    pub fn warmup(&mut self, closes: &[f64]) {
        for close in closes {
            self.update(*close);
        }
    }
}

fn smoothing(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
