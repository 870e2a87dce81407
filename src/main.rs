// ===============================
// src/main.rs
// ===============================
/*
 # generator feed, stop after 10s
 RUN_DURATION=10 cargo run

 # socket feed, push ticks by hand
 FEED_MODE=socket LISTEN_ADDR=127.0.0.1:9999 cargo run
 echo '{"symbol":"BTC","price":50123.5,"timestamp":1700000000}' | nc 127.0.0.1 9999

 # metrics
 METRICS_PORT=9898 cargo run &
 curl -s localhost:9898/metrics | egrep '^(signals_total|trades_total|portfolio_)'
*/
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sim_trader::config::{self, FeedSettings};
use sim_trader::coordinator::ShutdownCoordinator;
use sim_trader::metrics;

fn main() -> ExitCode {
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(1);
        }
    };

    // ---- Logging ----
    let filter = EnvFilter::try_new(&args.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();

    let settings = match args.settings() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_STRATEGY.with_label_values(&[args.strategy.as_str()]).set(1);
    if let Some(port) = args.metrics_port {
        if let Err(e) = metrics::serve_metrics(port) {
            warn!(port, error = %e, "metrics server not started");
        }
    }

    info!(
        feed_mode = args.feed_mode.as_str(),
        listen_addr = ?matches!(settings.feed, FeedSettings::Socket { .. }).then_some(args.listen_addr),
        symbol = %settings.symbol,
        strategy = settings.strategy.as_str(),
        max_history = settings.max_history,
        min_history = settings.min_history,
        initial_cash = settings.initial_cash,
        run_duration_s = args.run_duration,
        "startup config"
    );

    let coordinator = match ShutdownCoordinator::start(settings) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to start pipeline");
            return ExitCode::from(1);
        }
    };

    let interrupt = coordinator.interrupt_flag();
    let state = coordinator.state();
    if let Err(e) = ctrlc::set_handler(move || {
        interrupt.store(true, Ordering::Release);
        state.wake();
    }) {
        warn!(error = %e, "Ctrl-C handler not installed");
    }

    let summary = coordinator.run();
    println!("{summary}");
    if summary.reason.is_fatal() { ExitCode::from(2) } else { ExitCode::SUCCESS }
}
