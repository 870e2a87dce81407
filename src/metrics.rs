// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Pipeline throughput --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks produced").unwrap());

pub static TICKS_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ticks_malformed_total", "ingested lines dropped as malformed").unwrap()
});

pub static INGEST_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ingest_connections_total", "feed clients accepted").unwrap()
});

pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total", "strategy signals published (label: action)"),
        &["action"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_total", "trade attempts (labels: action, result)"),
        &["action", "result"],
    )
    .unwrap()
});

// -------- Portfolio --------
pub static PORTFOLIO_CASH: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_cash", "cash balance").unwrap());

pub static PORTFOLIO_UNITS: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_asset_units", "asset units held").unwrap());

pub static LAST_PRICE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("last_trade_price", "price of the last executed signal").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_STRATEGY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_strategy_active", "active strategy (label: strategy)"),
        &["strategy"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; re-registration is ignored
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_MALFORMED.clone())),
        REGISTRY.register(Box::new(INGEST_CONNECTIONS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_CASH.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_UNITS.clone())),
        REGISTRY.register(Box::new(LAST_PRICE.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY.clone())),
    ] {
        let _ = m;
    }
}

/// Prometheus text exposition of everything in `REGISTRY`.
pub fn encode_metrics() -> Vec<u8> {
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut body) {
        warn!(error = %e, "metrics encode failed");
        body.clear();
    }
    body
}

/// Status line and body for one raw HTTP request. Only `GET /` and
/// `GET /metrics` (query string ignored) are served.
fn respond(request: &[u8]) -> (&'static str, Vec<u8>) {
    let head = request.split(|&b| b == b'\r' || b == b'\n').next().unwrap_or_default();
    let head = String::from_utf8_lossy(head);
    let mut parts = head.split_whitespace();
    let (method, target) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());
    let path = target.split('?').next().unwrap_or_default();
    match (method, path) {
        ("GET", "/" | "/metrics") => ("200 OK", encode_metrics()),
        ("GET", _) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", b"method not allowed\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut req = [0u8; 1024];
    let n = match stream.read(&mut req) {
        Ok(n) => n,
        Err(e) => {
            debug!(error = %e, "metrics request read failed");
            return;
        }
    };
    let (status, body) = respond(&req[..n]);
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(header.as_bytes()).and_then(|_| stream.write_all(&body)) {
        debug!(error = %e, "metrics response write failed");
    }
}

/// Bind and serve on a detached OS thread. Lives for the whole process.
pub fn serve_metrics(port: u16) -> io::Result<JoinHandle<()>> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening (/ and /metrics)");
    thread::Builder::new().name("metrics".into()).spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    })
}
