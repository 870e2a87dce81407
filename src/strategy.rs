// ===============================
// src/strategy.rs
// ===============================
//
// Three strategies behind one `Strategy` trait:
// 1) SMA crossover   -> short (3) vs long (5) average flipping order
// 2) RSI threshold   -> 14-period RSI crossing 30 upward / 70 downward
// 3) Bollinger bands -> latest price outside mean +/- 2 sigma (20 periods)
//
// History is always oldest-first. `decide` never fails: short or degenerate
// input is HOLD, numeric trouble is HOLD plus a warning.
//

use clap::ValueEnum;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Action;

#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("non-finite price {value} at index {index}")]
    NonFinitePrice { index: usize, value: f64 },
    #[error("{indicator} evaluated to {value}")]
    NonFiniteIndicator { indicator: &'static str, value: f64 },
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Minimum history length for `evaluate` to be meaningful.
    fn required_history(&self) -> usize;

    fn evaluate(&self, history: &[f64]) -> Result<Action, StrategyError>;

    fn decide(&self, history: &[f64]) -> Action {
        if history.len() < self.required_history() {
            debug!(strategy = self.name(), have = history.len(), need = self.required_history(), "insufficient history, holding");
            return Action::Hold;
        }
        match self.evaluate(history) {
            Ok(action) => action,
            Err(e) => {
                warn!(strategy = self.name(), error = %e, "strategy evaluation failed, holding");
                Action::Hold
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyMode {
    #[value(alias = "sma_crossover", alias = "ma")]
    Sma,
    #[value(alias = "momentum_rsi")]
    Rsi,
    #[value(alias = "bollinger_bands", alias = "bb")]
    Bollinger,
}

impl StrategyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::Sma => "sma_crossover",
            StrategyMode::Rsi => "rsi_threshold",
            StrategyMode::Bollinger => "bollinger_bands",
        }
    }

    pub fn build(&self) -> Box<dyn Strategy> {
        match self {
            StrategyMode::Sma => Box::new(SmaCrossover::default()),
            StrategyMode::Rsi => Box::new(RsiThreshold::default()),
            StrategyMode::Bollinger => Box::new(BollingerBands::default()),
        }
    }
}

fn check_finite(window: &[f64], offset: usize) -> Result<(), StrategyError> {
    match window.iter().position(|p| !p.is_finite()) {
        Some(i) => Err(StrategyError::NonFinitePrice { index: offset + i, value: window[i] }),
        None => Ok(()),
    }
}

fn finite(indicator: &'static str, value: f64) -> Result<f64, StrategyError> {
    if value.is_finite() { Ok(value) } else { Err(StrategyError::NonFiniteIndicator { indicator, value }) }
}

/// Mean of the last `period` prices. Caller guarantees `prices.len() >= period > 0`.
fn sma(prices: &[f64], period: usize) -> f64 {
    let tail = &prices[prices.len() - period..];
    tail.iter().sum::<f64>() / period as f64
}

// -----------------------------------------------------------------------------
// 1) SMA CROSSOVER
//    BUY  : short SMA moves above long SMA (+threshold) on this tick
//    SELL : short SMA moves below long SMA (-threshold) on this tick
//    Needs long+1 prices so the previous tick has a full long window too.
// -----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct SmaCrossover {
    pub short: usize,
    pub long: usize,
    pub threshold: f64,
}

impl Default for SmaCrossover {
    fn default() -> Self { Self { short: 3, long: 5, threshold: 0.0 } }
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &'static str { "sma_crossover" }

    fn required_history(&self) -> usize { self.short.max(self.long) + 1 }

    fn evaluate(&self, history: &[f64]) -> Result<Action, StrategyError> {
        let Some(offset) = history.len().checked_sub(self.required_history()) else {
            return Ok(Action::Hold);
        };
        check_finite(&history[offset..], offset)?;

        let prev = &history[..history.len() - 1];
        let short_now = finite("sma_short", sma(history, self.short))?;
        let long_now = finite("sma_long", sma(history, self.long))?;
        let short_prev = finite("sma_short", sma(prev, self.short))?;
        let long_prev = finite("sma_long", sma(prev, self.long))?;

        let t = self.threshold;
        if short_now > long_now + t && short_prev <= long_prev + t {
            return Ok(Action::Buy);
        }
        if short_now < long_now - t && short_prev >= long_prev - t {
            return Ok(Action::Sell);
        }
        Ok(Action::Hold)
    }
}

// -----------------------------------------------------------------------------
// 2) RSI THRESHOLD
//    RSI = 100 - 100 / (1 + avg_gain / avg_loss) over the last `period` deltas,
//    simple averages; no losses at all -> 100.
//    BUY  : RSI crosses above `oversold` between previous and current tick
//    SELL : RSI crosses below `overbought`
// -----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct RsiThreshold {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiThreshold {
    fn default() -> Self { Self { period: 14, oversold: 30.0, overbought: 70.0 } }
}

impl RsiThreshold {
    /// RSI over the last `period` deltas. Caller guarantees `prices.len() > period`.
    pub fn rsi(&self, prices: &[f64]) -> f64 {
        let n = prices.len();
        let (mut gain, mut loss) = (0.0, 0.0);
        for w in prices[n - self.period - 1..].windows(2) {
            let change = w[1] - w[0];
            if change > 0.0 { gain += change } else { loss -= change }
        }
        let avg_gain = gain / self.period as f64;
        let avg_loss = loss / self.period as f64;
        if avg_loss == 0.0 {
            return 100.0;
        }
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

impl Strategy for RsiThreshold {
    fn name(&self) -> &'static str { "rsi_threshold" }

    fn required_history(&self) -> usize { self.period + 2 }

    fn evaluate(&self, history: &[f64]) -> Result<Action, StrategyError> {
        let Some(offset) = history.len().checked_sub(self.required_history()) else {
            return Ok(Action::Hold);
        };
        check_finite(&history[offset..], offset)?;

        let current = finite("rsi", self.rsi(history))?;
        let previous = finite("rsi", self.rsi(&history[..history.len() - 1]))?;

        if current > self.oversold && previous <= self.oversold {
            return Ok(Action::Buy);
        }
        if current < self.overbought && previous >= self.overbought {
            return Ok(Action::Sell);
        }
        Ok(Action::Hold)
    }
}

// -----------------------------------------------------------------------------
// 3) BOLLINGER BANDS
//    middle = SMA(period), sigma = population std-dev over the same window
//    BUY  : latest <= middle - k*sigma
//    SELL : latest >= middle + k*sigma
//    Flat window (sigma = 0): both bands sit on the price, BUY wins.
// -----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct BollingerBands {
    pub period: usize,
    pub k: f64,
}

impl Default for BollingerBands {
    fn default() -> Self { Self { period: 20, k: 2.0 } }
}

impl BollingerBands {
    /// (middle, sigma) over the last `period` prices.
    pub fn bands(&self, prices: &[f64]) -> (f64, f64) {
        let window = &prices[prices.len() - self.period..];
        let mean = window.iter().sum::<f64>() / self.period as f64;
        let var = window.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>() / self.period as f64;
        (mean, var.sqrt())
    }
}

impl Strategy for BollingerBands {
    fn name(&self) -> &'static str { "bollinger_bands" }

    fn required_history(&self) -> usize { self.period }

    fn evaluate(&self, history: &[f64]) -> Result<Action, StrategyError> {
        let Some(offset) = history.len().checked_sub(self.period) else {
            return Ok(Action::Hold);
        };
        check_finite(&history[offset..], offset)?;

        let (mean, sigma) = self.bands(history);
        let mean = finite("bollinger_mean", mean)?;
        let sigma = finite("bollinger_sigma", sigma)?;
        let latest = history[history.len() - 1];
        if latest <= mean - self.k * sigma {
            return Ok(Action::Buy);
        }
        if latest >= mean + self.k * sigma {
            return Ok(Action::Sell);
        }
        Ok(Action::Hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeat_then(value: f64, n: usize, last: &[f64]) -> Vec<f64> {
        let mut v = vec![value; n];
        v.extend_from_slice(last);
        v
    }

    #[test]
    fn every_strategy_holds_on_short_history() {
        for mode in [StrategyMode::Sma, StrategyMode::Rsi, StrategyMode::Bollinger] {
            let s = mode.build();
            for len in 0..s.required_history() {
                let history: Vec<f64> = (0..len).map(|i| 100.0 + (i as f64) * 7.0).collect();
                assert_eq!(s.decide(&history), Action::Hold, "{} len={len}", s.name());
            }
        }
    }

    #[test]
    fn sma_buys_on_upward_cross() {
        let h = repeat_then(10.0, 6, &[20.0]);
        assert_eq!(SmaCrossover::default().decide(&h), Action::Buy);
    }

    #[test]
    fn sma_sells_on_downward_cross() {
        let h = repeat_then(10.0, 6, &[0.0]);
        assert_eq!(SmaCrossover::default().decide(&h), Action::Sell);
    }

    #[test]
    fn sma_holds_when_order_unchanged() {
        // already above on the previous tick: no fresh crossover
        let h = vec![10.0, 10.0, 10.0, 10.0, 10.0, 20.0, 30.0];
        assert_eq!(SmaCrossover::default().decide(&h), Action::Hold);
    }

    #[test]
    fn rsi_buys_when_leaving_oversold() {
        let mut h: Vec<f64> = (0..15).map(|i| 200.0 - i as f64).collect();
        let last = *h.last().unwrap();
        h.push(last + 20.0);
        let s = RsiThreshold::default();
        assert_eq!(s.rsi(&h[..h.len() - 1]), 0.0);
        assert!(s.rsi(&h) > 30.0);
        assert_eq!(s.decide(&h), Action::Buy);
    }

    #[test]
    fn rsi_sells_when_leaving_overbought() {
        let mut h: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let last = *h.last().unwrap();
        h.push(last - 20.0);
        let s = RsiThreshold::default();
        assert_eq!(s.rsi(&h[..h.len() - 1]), 100.0);
        assert!(s.rsi(&h) < 70.0);
        assert_eq!(s.decide(&h), Action::Sell);
    }

    #[test]
    fn rsi_flat_market_holds() {
        assert_eq!(RsiThreshold::default().decide(&vec![50.0; 30]), Action::Hold);
    }

    #[test]
    fn bollinger_buys_below_lower_band() {
        let h = repeat_then(100.0, 19, &[50.0]);
        assert_eq!(BollingerBands::default().decide(&h), Action::Buy);
    }

    #[test]
    fn bollinger_sells_above_upper_band() {
        let h = repeat_then(100.0, 19, &[150.0]);
        assert_eq!(BollingerBands::default().decide(&h), Action::Sell);
    }

    #[test]
    fn bollinger_flat_window_buys_on_the_lower_band() {
        let flat = vec![100.0; 20];
        assert_eq!(BollingerBands::default().bands(&flat), (100.0, 0.0));
        assert_eq!(BollingerBands::default().decide(&flat), Action::Buy);
    }

    #[test]
    fn non_finite_prices_map_to_hold() {
        let mut h = repeat_then(100.0, 19, &[50.0]);
        h[10] = f64::NAN;
        let bb = BollingerBands::default();
        assert!(matches!(bb.evaluate(&h), Err(StrategyError::NonFinitePrice { index: 10, .. })));
        assert_eq!(bb.decide(&h), Action::Hold);

        let h = repeat_then(10.0, 6, &[f64::INFINITY]);
        assert_eq!(SmaCrossover::default().decide(&h), Action::Hold);
    }

    #[test]
    fn only_the_trailing_window_is_inspected() {
        // garbage far outside the window must not matter
        let mut h = vec![f64::NAN; 5];
        h.extend(repeat_then(10.0, 6, &[20.0]));
        assert_eq!(SmaCrossover::default().decide(&h), Action::Buy);
    }
}
