// ===============================
// src/executor.rs (portfolio & trade execution)
// ===============================
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Action, ActionSignal, Event};
use crate::metrics::{LAST_PRICE, PORTFOLIO_CASH, PORTFOLIO_UNITS, TRADES};
use crate::queue::SafeQueue;
use crate::recorder::EventSink;
use crate::state::SystemState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Portfolio {
    pub initial_cash: f64,
    pub cash: f64,
    pub asset_units: f64,
    pub total_trades: u64,
    pub total_buys: u64,
    pub total_sells: u64,
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        Self { initial_cash, cash: initial_cash, asset_units: 0.0, total_trades: 0, total_buys: 0, total_sells: 0 }
    }

    pub fn total_value(&self, price: f64) -> f64 { self.cash + self.asset_units * price }

    pub fn profit_loss(&self, price: f64) -> f64 { self.total_value(price) - self.initial_cash }
}

#[derive(Debug, Error, PartialEq)]
pub enum TradeError {
    #[error("insufficient cash: needed {needed:.2}, have {have:.2}")]
    InsufficientCash { needed: f64, have: f64 },
    #[error("insufficient assets: needed {needed}, have {have}")]
    InsufficientAssets { needed: f64, have: f64 },
    #[error("invalid order: price {price}, amount {amount}")]
    InvalidOrder { price: f64, amount: f64 },
}

/// Result of an applied trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub action: Action,
    pub price: f64,
    pub amount: f64,
    pub cash: f64,
    pub asset_units: f64,
}

/// Point-in-time valuation, read under the executor lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioReport {
    pub portfolio: Portfolio,
    pub price: f64,
    pub total_value: f64,
    pub profit_loss: f64,
}

impl fmt::Display for PortfolioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.portfolio;
        writeln!(f, "--- Portfolio Status ---")?;
        writeln!(f, "Current Cash: ${:.2}", p.cash)?;
        writeln!(f, "Asset Units: {:.5}", p.asset_units)?;
        writeln!(f, "Current Price: ${:.2}", self.price)?;
        writeln!(f, "Total Value: ${:.2}", self.total_value)?;
        writeln!(f, "Initial Capital: ${:.2}", p.initial_cash)?;
        writeln!(f, "Profit/Loss: ${:.2}", self.profit_loss)?;
        writeln!(f, "Total Trades: {}", p.total_trades)?;
        writeln!(f, "Total Buy Actions: {}", p.total_buys)?;
        writeln!(f, "Total Sell Actions: {}", p.total_sells)?;
        write!(f, "------------------------")
    }
}

#[derive(Debug)]
struct Book {
    portfolio: Portfolio,
    last_price: Option<f64>,
}

fn valid_order(price: f64, amount: f64) -> Result<(), TradeError> {
    if price.is_finite() && amount.is_finite() && price > 0.0 && amount > 0.0 {
        Ok(())
    } else {
        Err(TradeError::InvalidOrder { price, amount })
    }
}

/// Owns the portfolio. Every read and write goes through one private lock.
#[derive(Debug)]
pub struct TradeExecutor {
    book: Mutex<Book>,
    sink: EventSink,
}

impl TradeExecutor {
    pub fn new(initial_cash: f64, sink: EventSink) -> Self {
        PORTFOLIO_CASH.set(initial_cash);
        PORTFOLIO_UNITS.set(0.0);
        Self { book: Mutex::new(Book { portfolio: Portfolio::new(initial_cash), last_price: None }), sink }
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_buy(p: &mut Portfolio, price: f64, amount: f64) -> Result<Fill, TradeError> {
        valid_order(price, amount)?;
        let needed = price * amount;
        if p.cash < needed {
            return Err(TradeError::InsufficientCash { needed, have: p.cash });
        }
        p.cash -= needed;
        p.asset_units += amount;
        p.total_trades += 1;
        p.total_buys += 1;
        Ok(Fill { action: Action::Buy, price, amount, cash: p.cash, asset_units: p.asset_units })
    }

    fn apply_sell(p: &mut Portfolio, price: f64, amount: f64) -> Result<Fill, TradeError> {
        valid_order(price, amount)?;
        if p.asset_units < amount {
            return Err(TradeError::InsufficientAssets { needed: amount, have: p.asset_units });
        }
        p.cash += price * amount;
        p.asset_units -= amount;
        p.total_trades += 1;
        p.total_sells += 1;
        Ok(Fill { action: Action::Sell, price, amount, cash: p.cash, asset_units: p.asset_units })
    }

    pub fn buy(&self, price: f64, amount: f64) -> Result<Fill, TradeError> {
        let mut book = self.lock();
        let fill = Self::apply_buy(&mut book.portfolio, price, amount)?;
        Self::publish_balances(&book.portfolio);
        Ok(fill)
    }

    pub fn sell(&self, price: f64, amount: f64) -> Result<Fill, TradeError> {
        let mut book = self.lock();
        let fill = Self::apply_sell(&mut book.portfolio, price, amount)?;
        Self::publish_balances(&book.portfolio);
        Ok(fill)
    }

    fn publish_balances(p: &Portfolio) {
        PORTFOLIO_CASH.set(p.cash);
        PORTFOLIO_UNITS.set(p.asset_units);
    }

    /// Dispatch one signal. HOLD is a successful no-op; rejections are logged
    /// and reported as `false`, never raised.
    pub fn handle_signal(&self, action: Action, price: f64, amount: f64) -> bool {
        let result = match action {
            Action::Buy => self.buy(price, amount),
            Action::Sell => self.sell(price, amount),
            Action::Hold => {
                debug!("HOLD signal received, nothing to do");
                return true;
            }
        };
        match result {
            Ok(fill) => {
                TRADES.with_label_values(&[action.as_str(), "filled"]).inc();
                info!(%action, amount, price, cash = fill.cash, units = fill.asset_units, "order executed");
                self.sink.record(Event::Fill {
                    action,
                    price,
                    amount,
                    cash: fill.cash,
                    asset_units: fill.asset_units,
                });
                true
            }
            Err(e) => {
                TRADES.with_label_values(&[action.as_str(), "rejected"]).inc();
                warn!(%action, amount, price, reason = %e, "order rejected");
                self.sink.record(Event::Reject { action, price, amount, reason: e.to_string() });
                false
            }
        }
    }

    /// Record the signal's price as the current price, then apply it.
    pub fn apply(&self, signal: &ActionSignal) -> bool {
        {
            let mut book = self.lock();
            book.last_price = Some(signal.price);
        }
        LAST_PRICE.set(signal.price);
        self.handle_signal(signal.action, signal.price, signal.amount)
    }

    pub fn current_price(&self) -> Option<f64> { self.lock().last_price }

    pub fn snapshot(&self) -> Portfolio { self.lock().portfolio.clone() }

    pub fn total_value(&self, price: f64) -> f64 { self.lock().portfolio.total_value(price) }

    pub fn profit_loss(&self, price: f64) -> f64 { self.lock().portfolio.profit_loss(price) }

    pub fn report_status(&self, price: f64) -> PortfolioReport {
        let book = self.lock();
        let p = &book.portfolio;
        PortfolioReport {
            portfolio: p.clone(),
            price,
            total_value: p.total_value(price),
            profit_loss: p.profit_loss(price),
        }
    }

    /// Stage loop: bounded wait on the signal queue, one signal per
    /// iteration, throttle, recheck flags.
    pub fn run(self: Arc<Self>, state: Arc<SystemState>, signals: Arc<SafeQueue<ActionSignal>>, wait: Duration, throttle: Duration) {
        info!("trade executor started");
        let mut handled: u64 = 0;
        while state.should_run() {
            let Some(signal) = signals.pop_wait(wait, || !state.should_run()) else {
                debug!("timeout waiting for action signal, rechecking flags");
                continue;
            };
            debug!(action = %signal.action, price = signal.price, amount = signal.amount, "received action signal");
            self.apply(&signal);
            handled += 1;
            sleep(throttle);
        }
        info!(signals = handled, "trade executor stopped");
    }
}
