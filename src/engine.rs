// ===============================
// src/engine.rs
// ===============================
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::{Action, ActionSignal, Event, TradeData, DEFAULT_TRADE_AMOUNT};
use crate::metrics::SIGNALS;
use crate::queue::SafeQueue;
use crate::recorder::EventSink;
use crate::state::SystemState;
use crate::strategy::Strategy;

/// Bounded oldest-first price window owned by the strategy stage.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    prices: VecDeque<f64>,
    max: usize,
}

impl PriceHistory {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self { prices: VecDeque::with_capacity(max + 1), max }
    }

    /// Append and evict the oldest entry once over the bound.
    pub fn push(&mut self, price: f64) -> Option<f64> {
        self.prices.push_back(price);
        if self.prices.len() > self.max { self.prices.pop_front() } else { None }
    }

    pub fn len(&self) -> usize { self.prices.len() }

    pub fn is_empty(&self) -> bool { self.prices.is_empty() }

    pub fn capacity(&self) -> usize { self.max }

    pub fn as_slice(&mut self) -> &[f64] { self.prices.make_contiguous() }

    pub fn latest(&self) -> Option<f64> { self.prices.back().copied() }
}

pub struct StrategyEngine {
    history: PriceHistory,
    min_history: usize,
    strategy: Box<dyn Strategy>,
    signals: Arc<SafeQueue<ActionSignal>>,
    sink: EventSink,
    trade_amount: f64,
}

impl StrategyEngine {
    pub fn new(
        strategy: Box<dyn Strategy>,
        max_history: usize,
        min_history: usize,
        signals: Arc<SafeQueue<ActionSignal>>,
        sink: EventSink,
    ) -> Self {
        Self {
            history: PriceHistory::new(max_history),
            min_history,
            strategy,
            signals,
            sink,
            trade_amount: DEFAULT_TRADE_AMOUNT,
        }
    }

    pub fn history(&self) -> &PriceHistory { &self.history }

    /// Feed one tick. Publishes and returns the signal for BUY/SELL.
    pub fn on_tick(&mut self, tick: &TradeData) -> Option<ActionSignal> {
        self.history.push(tick.price);

        let action = if self.history.len() < self.min_history {
            Action::Hold
        } else {
            let window = self.history.as_slice();
            self.strategy.decide(window)
        };

        if !action.is_trade() {
            debug!(price = tick.price, len = self.history.len(), "no signal (HOLD)");
            return None;
        }

        let signal = ActionSignal::new(action, tick.price, self.trade_amount);
        self.sink.record(Event::Signal(signal.clone()));
        self.signals.push(signal.clone());
        SIGNALS.with_label_values(&[action.as_str()]).inc();
        info!(strategy = self.strategy.name(), %action, price = tick.price, amount = self.trade_amount, "generated signal");
        Some(signal)
    }

    /// Stage loop: bounded wait on the market-data queue, one tick per
    /// iteration, throttle, recheck flags.
    pub fn run(mut self, state: Arc<SystemState>, market: Arc<SafeQueue<TradeData>>, wait: Duration, throttle: Duration) {
        info!(strategy = self.strategy.name(), max_history = self.history.capacity(), min_history = self.min_history, "strategy engine started");
        let mut processed: u64 = 0;
        while state.should_run() {
            let Some(tick) = market.pop_wait(wait, || !state.should_run()) else {
                debug!("timeout waiting for price data, rechecking flags");
                continue;
            };
            self.on_tick(&tick);
            processed += 1;
            sleep(throttle);
        }
        info!(ticks = processed, "strategy engine stopped");
    }
}
