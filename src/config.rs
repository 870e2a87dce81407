// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : sim_trader_rust: threaded tick -> signal -> portfolio pipeline
Module  : config.rs
Version : 0.1.0

Summary : Feeds price ticks (random walk or line-delimited JSON over TCP)
          through a pluggable strategy stage (SMA crossover, RSI, Bollinger)
          into a simulated cash/asset portfolio, with coordinated shutdown.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::strategy::StrategyMode;

/// Market data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    /// Seeded random walk, one tick per tick interval.
    Generator,
    /// Newline-delimited JSON ticks over a TCP listener.
    Socket,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Generator => "generator",
            FeedMode::Socket => "socket",
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "sim_trader", version, about = "Simulated tick -> signal -> portfolio pipeline")]
pub struct Args {
    #[arg(long, env = "FEED_MODE", value_enum, default_value = "generator")]
    pub feed_mode: FeedMode,

    /// Listen address for the socket feed.
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:9999")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "SYMBOL", default_value = "BTC")]
    pub symbol: String,

    #[arg(long, env = "STRATEGY", value_enum, default_value = "sma")]
    pub strategy: StrategyMode,

    #[arg(long, env = "MAX_HISTORY", default_value_t = 70)]
    pub max_history: usize,

    #[arg(long, env = "MIN_HISTORY", default_value_t = 10)]
    pub min_history: usize,

    #[arg(long, env = "DEFAULT_CASH", default_value_t = 10_000.0)]
    pub initial_cash: f64,

    /// Seconds to run before a graceful stop; 0 runs until interrupted.
    #[arg(long, env = "RUN_DURATION", default_value_t = 30)]
    pub run_duration: u64,

    /// tracing filter directive (e.g. `info`, `sim_trader=debug`).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Test hook: mark the system broken after this many generated ticks.
    #[arg(long, env = "FAULT_AFTER_TICKS")]
    pub fault_after_ticks: Option<u64>,

    /// Stop gracefully once this file exists.
    #[arg(long, env = "STOP_FILE")]
    pub stop_file: Option<PathBuf>,

    /// Append every tick/signal/fill as JSON lines to this file.
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<PathBuf>,

    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Seed for the random-walk generator.
    #[arg(long, env = "FEED_SEED")]
    pub seed: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MAX_HISTORY must be at least 1")]
    EmptyHistory,
    #[error("MIN_HISTORY ({min}) exceeds MAX_HISTORY ({max})")]
    HistoryBounds { min: usize, max: usize },
    #[error("DEFAULT_CASH must be a finite, non-negative amount (got {0})")]
    Cash(f64),
    #[error("config file {path}: {source}")]
    File { path: PathBuf, source: dotenvy::Error },
}

/// Every wait bound used by the stages and the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub queue_wait: Duration,
    pub throttle: Duration,
    pub tick_interval: Duration,
    pub recv_timeout: Duration,
    pub accept_poll: Duration,
    pub monitor_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            queue_wait: Duration::from_secs(2),
            throttle: Duration::from_millis(50),
            tick_interval: Duration::from_millis(500),
            recv_timeout: Duration::from_millis(500),
            accept_poll: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(500),
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub enum FeedSettings {
    Generator { seed: Option<u64>, fault_after_ticks: Option<u64> },
    Socket { listen_addr: SocketAddr },
}

/// Validated startup configuration consumed by the coordinator.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub feed: FeedSettings,
    pub symbol: String,
    pub strategy: StrategyMode,
    pub max_history: usize,
    pub min_history: usize,
    pub initial_cash: f64,
    /// `None` runs until stopped externally.
    pub run_duration: Option<Duration>,
    pub stop_file: Option<PathBuf>,
    pub record_file: Option<PathBuf>,
    pub timings: Timings,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history == 0 {
            return Err(ConfigError::EmptyHistory);
        }
        if self.min_history > self.max_history {
            return Err(ConfigError::HistoryBounds { min: self.min_history, max: self.max_history });
        }
        if !self.initial_cash.is_finite() || self.initial_cash < 0.0 {
            return Err(ConfigError::Cash(self.initial_cash));
        }
        Ok(())
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            feed: FeedSettings::Generator { seed: None, fault_after_ticks: None },
            symbol: "BTC".to_string(),
            strategy: StrategyMode::Sma,
            max_history: 70,
            min_history: 10,
            initial_cash: 10_000.0,
            run_duration: Some(Duration::from_secs(30)),
            stop_file: None,
            record_file: None,
            timings: Timings::default(),
        }
    }
}

impl Args {
    pub fn settings(&self) -> Result<PipelineSettings, ConfigError> {
        let feed = match self.feed_mode {
            FeedMode::Generator => FeedSettings::Generator {
                seed: self.seed,
                fault_after_ticks: self.fault_after_ticks,
            },
            FeedMode::Socket => FeedSettings::Socket { listen_addr: self.listen_addr },
        };
        let settings = PipelineSettings {
            feed,
            symbol: self.symbol.clone(),
            strategy: self.strategy,
            max_history: self.max_history,
            min_history: self.min_history,
            initial_cash: self.initial_cash,
            run_duration: (self.run_duration > 0).then(|| Duration::from_secs(self.run_duration)),
            stop_file: self.stop_file.clone(),
            record_file: self.record_file.clone(),
            timings: Timings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// `.env` first, then the KEY=VALUE file named by `TRADER_CONFIG`, then CLI
/// flags. Values already in the environment win over both files.
pub fn load() -> Result<Args, ConfigError> {
    let _ = dotenvy::dotenv();
    if let Ok(path) = std::env::var("TRADER_CONFIG") {
        let path = PathBuf::from(path);
        dotenvy::from_path(&path).map_err(|source| ConfigError::File { path, source })?;
    }
    Ok(Args::parse())
}
