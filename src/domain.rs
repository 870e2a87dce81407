// ===============================
// src/domain.rs
// ===============================
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed order size attached to every published signal.
pub const DEFAULT_TRADE_AMOUNT: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action { Buy, Sell, Hold }

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "BUY", Action::Sell => "SELL", Action::Hold => "HOLD" }
    }
    pub fn is_trade(&self) -> bool { !matches!(self, Action::Hold) }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub fn now_ms() -> i64 { Utc::now().timestamp_millis() }

/// One price observation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub price: f64,
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl TradeData {
    pub fn new(price: f64) -> Self { Self { price, ts_ms: now_ms(), symbol: None } }
    pub fn at(price: f64, ts_ms: i64, symbol: Option<String>) -> Self { Self { price, ts_ms, symbol } }
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSignal { pub action: Action, pub price: f64, pub amount: f64, pub ts_ms: i64 }

impl ActionSignal {
    pub fn new(action: Action, price: f64, amount: f64) -> Self {
        Self { action, price, amount, ts_ms: now_ms() }
    }
}

/// Envelope written by the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Tick(TradeData),
    Signal(ActionSignal),
    Fill { action: Action, price: f64, amount: f64, cash: f64, asset_units: f64 },
    Reject { action: Action, price: f64, amount: f64, reason: String },
    Note { message: String },
}
