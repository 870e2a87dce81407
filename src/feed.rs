// ===============================
// src/feed.rs
// ===============================
//
// Market data sources:
// - Generator      : seeded random walk, one tick per tick interval
// - SocketIngester : newline-delimited JSON ticks over TCP, one client at a
//                    time, back to accepting whenever the client goes away
//
// Wire format (one message per line):
//   {"symbol":"BTC","price":123.45,"timestamp":1700000000000}
// Integer timestamps are epoch millis; fractional ones are epoch seconds
// (what a Python `time.time()` feeder sends).
//

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Event, TradeData};
use crate::metrics::{INGEST_CONNECTIONS, TICKS, TICKS_MALFORMED};
use crate::queue::SafeQueue;
use crate::recorder::EventSink;
use crate::state::SystemState;

pub const START_PRICE: f64 = 50_000.0;
pub const PRICE_FLOOR: f64 = 30_000.0;
pub const PRICE_CEIL: f64 = 80_000.0;
const MAX_PERTURBATION: f64 = 2_000.0;
const PERTURBATION_SCALE: f64 = 0.1;
const READ_CHUNK: usize = 1024;
/// Longest accepted line; anything longer is dropped up to its newline.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Where produced ticks go: the market-data queue plus the optional recorder.
#[derive(Clone)]
pub struct TickOutput {
    pub queue: Arc<SafeQueue<TradeData>>,
    pub sink: EventSink,
}

impl TickOutput {
    fn publish(&self, tick: TradeData) {
        self.sink.record(Event::Tick(tick.clone()));
        // push wakes one waiting consumer
        self.queue.push(tick);
        TICKS.inc();
    }
}

// -----------------------------------------------------------------------------
// Random walk generator
// -----------------------------------------------------------------------------
#[derive(Debug)]
pub struct RandomWalk {
    price: f64,
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { price: START_PRICE, rng }
    }

    pub fn price(&self) -> f64 { self.price }

    /// Apply one perturbation drawn from [-2000, 2000], scaled and clamped.
    pub fn step(&mut self, perturbation: f64) -> f64 {
        self.price = (self.price + perturbation * PERTURBATION_SCALE).clamp(PRICE_FLOOR, PRICE_CEIL);
        self.price
    }

    pub fn next_price(&mut self) -> f64 {
        let p = self.rng.gen_range(-MAX_PERTURBATION..=MAX_PERTURBATION);
        self.step(p)
    }
}

pub struct Generator {
    pub walk: RandomWalk,
    pub symbol: String,
    pub tick_interval: Duration,
    /// Test hook: latch `broken` after this many ticks.
    pub fault_after_ticks: Option<u64>,
}

impl Generator {
    pub fn new(symbol: impl Into<String>, seed: Option<u64>, tick_interval: Duration) -> Self {
        Self { walk: RandomWalk::new(seed), symbol: symbol.into(), tick_interval, fault_after_ticks: None }
    }

    pub fn with_fault_after(mut self, ticks: Option<u64>) -> Self {
        self.fault_after_ticks = ticks;
        self
    }

    /// Stage loop. Returns the number of ticks produced.
    pub fn run(mut self, state: Arc<SystemState>, out: TickOutput) -> u64 {
        info!(symbol = %self.symbol, interval_ms = self.tick_interval.as_millis() as u64, "generator started");
        let mut produced: u64 = 0;
        while state.should_run() {
            // the limit is checked before publishing, so Some(0) emits nothing
            if self.fault_after_ticks.is_some_and(|limit| produced >= limit) {
                warn!(ticks = produced, "fault injection: simulating critical upstream failure");
                state.mark_broken("simulated feed failure");
                break;
            }
            let price = self.walk.next_price();
            out.publish(TradeData::new(price).with_symbol(self.symbol.clone()));
            produced += 1;
            debug!(price, "generated tick");
            sleep(self.tick_interval);
        }
        info!(ticks = produced, "generator stopped");
        produced
    }
}

// -----------------------------------------------------------------------------
// Socket ingester
// -----------------------------------------------------------------------------
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid utf-8 in message")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid price {0}")]
    Price(f64),
    #[error("invalid timestamp {0}")]
    Timestamp(serde_json::Number),
}

#[derive(Debug, Deserialize)]
struct WireTick {
    #[serde(default)]
    symbol: Option<String>,
    price: f64,
    #[serde(default)]
    timestamp: Option<serde_json::Number>,
}

fn timestamp_ms(ts: serde_json::Number) -> Result<i64, FeedError> {
    if let Some(ms) = ts.as_i64() {
        return Ok(ms);
    }
    match ts.as_f64() {
        Some(secs) if secs.is_finite() && secs >= 0.0 && secs < (i64::MAX / 1000) as f64 => {
            Ok((secs * 1000.0).round() as i64)
        }
        _ => Err(FeedError::Timestamp(ts)),
    }
}

/// Parse one message (without its trailing newline). `Ok(None)` for blank lines.
pub fn parse_line(line: &[u8], default_symbol: &str) -> Result<Option<TradeData>, FeedError> {
    let text = std::str::from_utf8(line)?.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let wire: WireTick = serde_json::from_str(text)?;
    if !wire.price.is_finite() || wire.price <= 0.0 {
        return Err(FeedError::Price(wire.price));
    }
    let ts_ms = match wire.timestamp {
        Some(ts) => timestamp_ms(ts)?,
        None => now_ms(),
    };
    let symbol = wire.symbol.unwrap_or_else(|| default_symbol.to_string());
    Ok(Some(TradeData::at(wire.price, ts_ms, Some(symbol))))
}

/// Split complete lines off the front of `buf`; a trailing partial line stays.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        lines.push(line);
    }
    lines
}

/// Shared with the coordinator so it can force-close the live connection and
/// unblock a read parked on it.
#[derive(Debug, Default)]
pub struct IngestHandle {
    conn: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl IngestHandle {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("ingest handle closed");
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Returns false if the handle was already closed; the caller should then
    /// drop the connection.
    fn attach(&self, stream: &TcpStream) -> bool {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        *slot = stream.try_clone().ok();
        true
    }

    fn release(&self) {
        if let Some(stream) = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

pub struct SocketIngester {
    listener: TcpListener,
    handle: Arc<IngestHandle>,
    symbol: String,
    recv_timeout: Duration,
    accept_poll: Duration,
}

impl SocketIngester {
    pub fn bind(
        addr: impl ToSocketAddrs,
        symbol: impl Into<String>,
        recv_timeout: Duration,
        accept_poll: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        // non-blocking accept: the loop polls and rechecks the flags
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            handle: Arc::new(IngestHandle::default()),
            symbol: symbol.into(),
            recv_timeout,
            accept_poll,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.listener.local_addr() }

    pub fn handle(&self) -> Arc<IngestHandle> { self.handle.clone() }

    fn alive(&self, state: &SystemState) -> bool { state.should_run() && !self.handle.is_closed() }

    /// Stage loop. Returns the number of ticks ingested.
    pub fn run(self, state: Arc<SystemState>, out: TickOutput) -> u64 {
        let addr = self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        info!(%addr, "socket ingester listening");
        let mut ingested: u64 = 0;
        while self.alive(&state) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    INGEST_CONNECTIONS.inc();
                    info!(%peer, "feed client connected");
                    ingested += self.serve(stream, &state, &out);
                    info!(%peer, "feed client released, accepting again");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => sleep(self.accept_poll),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    sleep(self.accept_poll);
                }
            }
        }
        self.handle.release();
        info!(ticks = ingested, "socket ingester stopped");
        ingested
    }

    fn serve(&self, mut stream: TcpStream, state: &SystemState, out: &TickOutput) -> u64 {
        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(self.recv_timeout)))
        {
            warn!(error = %e, "could not configure client socket, dropping it");
            return 0;
        }
        if !self.handle.attach(&stream) {
            return 0;
        }

        let mut ingested = 0;
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut skipping = false;
        while self.alive(state) {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    info!("feed client disconnected");
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if skipping {
                        match buf.iter().position(|&b| b == b'\n') {
                            Some(end) => {
                                buf.drain(..=end);
                                skipping = false;
                            }
                            None => {
                                buf.clear();
                                continue;
                            }
                        }
                    }
                    for line in drain_lines(&mut buf) {
                        match parse_line(&line, &self.symbol) {
                            Ok(Some(tick)) => {
                                debug!(price = tick.price, ts_ms = tick.ts_ms, "ingested tick");
                                out.publish(tick);
                                ingested += 1;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                TICKS_MALFORMED.inc();
                                warn!(error = %e, line = %String::from_utf8_lossy(&line), "malformed message skipped");
                            }
                        }
                    }
                    if buf.len() > MAX_LINE_BYTES {
                        TICKS_MALFORMED.inc();
                        warn!(bytes = buf.len(), limit = MAX_LINE_BYTES, "unterminated line over limit, skipping to next newline");
                        buf.clear();
                        skipping = true;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    debug!("receive timeout, rechecking flags");
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "feed connection error");
                    break;
                }
            }
        }
        if !buf.is_empty() {
            debug!(bytes = buf.len(), "discarding partial line");
        }
        self.handle.release();
        ingested
    }
}
