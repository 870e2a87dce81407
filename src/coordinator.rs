// ===============================
// src/coordinator.rs (start / monitor / coordinated shutdown)
// ===============================
//
// Phases: Starting -> Running -> Stopping -> Stopped (linear).
//
// Every stage wait is either bounded by a timeout or unblocked here:
// queues get `wake_all` and the socket ingester's live connection is
// force-closed through its handle. The recorder stops last, after every
// producer has been joined.
//
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{FeedSettings, PipelineSettings, Timings};
use crate::domain::{ActionSignal, Event, TradeData};
use crate::engine::StrategyEngine;
use crate::executor::{PortfolioReport, TradeExecutor};
use crate::feed::{Generator, IngestHandle, SocketIngester, TickOutput};
use crate::queue::SafeQueue;
use crate::recorder::{EventSink, Recorder};
use crate::state::SystemState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("bind feed listener on {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, source: io::Error },
    #[error("open record file {path}: {source}")]
    Recorder { path: PathBuf, source: io::Error },
    #[error("spawn {name} thread: {source}")]
    Spawn { name: &'static str, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase { Starting, Running, Stopping, Stopped }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stage latched the broken flag.
    Fatal,
    /// Ctrl-C / external interrupt.
    Interrupted,
    /// The stop marker file appeared.
    StopFile,
    DurationElapsed,
}

impl StopReason {
    pub fn is_fatal(&self) -> bool { matches!(self, StopReason::Fatal) }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: StopReason,
    pub report: PortfolioReport,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match self.reason {
            StopReason::Fatal => "System stopped due to a critical error in one of the components!",
            StopReason::Interrupted => "System stopped gracefully on interrupt.",
            StopReason::StopFile => "System stopped gracefully on stop request.",
            StopReason::DurationElapsed => "System stopped gracefully after running for the specified duration.",
        };
        writeln!(f, "--- {headline} ---")?;
        write!(f, "{}", self.report)
    }
}

pub struct ShutdownCoordinator {
    state: Arc<SystemState>,
    market: Arc<SafeQueue<TradeData>>,
    signals: Arc<SafeQueue<ActionSignal>>,
    events: Option<Arc<SafeQueue<Event>>>,
    sink: EventSink,
    executor: Arc<TradeExecutor>,
    ingest: Option<Arc<IngestHandle>>,
    feed_addr: Option<std::net::SocketAddr>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    recorder: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    interrupt: Arc<AtomicBool>,
    phase: Phase,
    started_at: Instant,
    run_duration: Option<Duration>,
    stop_file: Option<PathBuf>,
    timings: Timings,
}

enum FeedStage {
    Generator(Generator),
    Socket(SocketIngester),
}

fn spawn<F>(name: &'static str, f: F) -> Result<(&'static str, JoinHandle<()>), PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map(|h| (name, h))
        .map_err(|source| PipelineError::Spawn { name, source })
}

fn join_logged(name: &'static str, handle: JoinHandle<()>) {
    let started = Instant::now();
    match handle.join() {
        Ok(()) => info!(thread = name, waited_ms = started.elapsed().as_millis() as u64, "thread joined"),
        Err(_) => error!(thread = name, "thread panicked"),
    }
}

impl ShutdownCoordinator {
    /// Starting: build shared state, queues and stages, then start the threads.
    pub fn start(settings: PipelineSettings) -> Result<Self, PipelineError> {
        settings.validate()?;
        let timings = settings.timings;

        let state = Arc::new(SystemState::new());
        let market: Arc<SafeQueue<TradeData>> = Arc::new(SafeQueue::new());
        let signals: Arc<SafeQueue<ActionSignal>> = Arc::new(SafeQueue::new());

        let (events, recorder) = match &settings.record_file {
            Some(path) => {
                let recorder = Recorder::open(path)
                    .map_err(|source| PipelineError::Recorder { path: path.clone(), source })?;
                (Some(Arc::new(SafeQueue::new())), Some(recorder))
            }
            None => (None, None),
        };
        let sink = events.clone().map(EventSink::new).unwrap_or_default();

        // bind before any thread starts so a bad address fails cleanly
        let stage = match &settings.feed {
            FeedSettings::Socket { listen_addr } => FeedStage::Socket(
                SocketIngester::bind(*listen_addr, settings.symbol.clone(), timings.recv_timeout, timings.accept_poll)
                    .map_err(|source| PipelineError::Bind { addr: *listen_addr, source })?,
            ),
            FeedSettings::Generator { seed, fault_after_ticks } => FeedStage::Generator(
                Generator::new(settings.symbol.clone(), *seed, timings.tick_interval)
                    .with_fault_after(*fault_after_ticks),
            ),
        };
        let (ingest, feed_addr) = match &stage {
            FeedStage::Socket(ingester) => (Some(ingester.handle()), ingester.local_addr().ok()),
            FeedStage::Generator(_) => (None, None),
        };

        let executor = Arc::new(TradeExecutor::new(settings.initial_cash, sink.clone()));
        let engine = StrategyEngine::new(
            settings.strategy.build(),
            settings.max_history,
            settings.min_history,
            signals.clone(),
            sink.clone(),
        );

        let mut coordinator = Self {
            state: state.clone(),
            market: market.clone(),
            signals: signals.clone(),
            events: events.clone(),
            sink: sink.clone(),
            executor: executor.clone(),
            ingest,
            feed_addr,
            threads: Vec::new(),
            recorder: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            phase: Phase::Starting,
            started_at: Instant::now(),
            run_duration: settings.run_duration,
            stop_file: settings.stop_file.clone(),
            timings,
        };

        // on a failed spawn, Drop unwinds whatever already started
        if let (Some(recorder), Some(events)) = (recorder, events) {
            // own latch: the recorder outlives every producer
            let stop = Arc::new(AtomicBool::new(false));
            let latch = stop.clone();
            let (_, handle) = spawn("recorder", move || {
                recorder.run(latch, events, timings.queue_wait, timings.flush_interval)
            })?;
            coordinator.recorder = Some((stop, handle));
        }
        {
            let st = state.clone();
            let sig = signals.clone();
            let ex = executor.clone();
            coordinator.threads.push(spawn("executor", move || {
                ex.run(st, sig, timings.queue_wait, timings.throttle)
            })?);
        }
        {
            let st = state.clone();
            let md = market.clone();
            coordinator.threads.push(spawn("strategy", move || {
                engine.run(st, md, timings.queue_wait, timings.throttle)
            })?);
        }
        coordinator.sink.record(Event::Note { message: "pipeline started".into() });
        let out = TickOutput { queue: market, sink };
        let feed = spawn("feed", move || {
            let ticks = match stage {
                FeedStage::Generator(generator) => generator.run(state, out),
                FeedStage::Socket(ingester) => ingester.run(state, out),
            };
            info!(ticks, "feed stage exited");
        })?;
        coordinator.threads.push(feed);

        coordinator.phase = Phase::Running;
        coordinator.started_at = Instant::now();
        info!(
            threads = coordinator.threads.len() + usize::from(coordinator.recorder.is_some()),
            "all stages started"
        );
        Ok(coordinator)
    }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn state(&self) -> Arc<SystemState> { self.state.clone() }

    pub fn executor(&self) -> Arc<TradeExecutor> { self.executor.clone() }

    /// Bound address of the socket feed, if any.
    pub fn feed_addr(&self) -> Option<std::net::SocketAddr> { self.feed_addr }

    /// Set this (e.g. from a signal handler) to request a graceful stop, then
    /// call `SystemState::wake` so the monitor sees it immediately.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> { self.interrupt.clone() }

    /// Non-blocking check of every stop trigger.
    pub fn stop_trigger(&self) -> Option<StopReason> {
        if self.state.is_broken() {
            return Some(StopReason::Fatal);
        }
        if self.interrupt.load(Ordering::Acquire) {
            return Some(StopReason::Interrupted);
        }
        if self.stop_file.as_ref().is_some_and(|p| p.exists()) {
            return Some(StopReason::StopFile);
        }
        if self.run_duration.is_some_and(|d| self.started_at.elapsed() >= d) {
            return Some(StopReason::DurationElapsed);
        }
        None
    }

    /// Running: sleep on the broken condvar, waking every monitor interval
    /// to poll the other triggers.
    pub fn monitor(&self) -> StopReason {
        info!(
            run_duration = ?self.run_duration,
            stop_file = ?self.stop_file,
            "running until a stop trigger fires"
        );
        loop {
            if let Some(reason) = self.stop_trigger() {
                info!(?reason, "stop trigger fired");
                return reason;
            }
            self.state
                .wait_broken_or(self.timings.monitor_interval, || self.interrupt.load(Ordering::Acquire));
        }
    }

    /// Stopping -> Stopped. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        if matches!(self.phase, Phase::Stopping | Phase::Stopped) {
            return;
        }
        self.phase = Phase::Stopping;
        info!("signaling threads to shut down");

        self.state.request_stop();
        self.market.wake_all();
        self.signals.wake_all();
        if let Some(ingest) = &self.ingest {
            ingest.close();
        }

        for (name, handle) in self.threads.drain(..) {
            join_logged(name, handle);
        }

        // producers are gone; whatever they recorded is queued by now
        if let Some((stop, handle)) = self.recorder.take() {
            self.sink.record(Event::Note { message: "pipeline stopped".into() });
            stop.store(true, Ordering::Release);
            if let Some(events) = &self.events {
                events.wake_all();
            }
            join_logged("recorder", handle);
        }
        self.phase = Phase::Stopped;
        info!("all threads stopped");
    }

    /// Final report at the last price the executor saw.
    pub fn final_report(&self) -> PortfolioReport {
        let price = self.executor.current_price().unwrap_or_else(|| {
            warn!("no trade price observed, valuing assets at 0");
            0.0
        });
        self.executor.report_status(price)
    }

    /// monitor -> shutdown -> report.
    pub fn run(mut self) -> RunSummary {
        let reason = self.monitor();
        self.sink.record(Event::Note { message: format!("stopping: {reason:?}") });
        self.shutdown();
        let summary = RunSummary { reason, report: self.final_report() };
        if reason.is_fatal() {
            error!("system stopped due to a critical error");
        } else {
            info!(?reason, "system stopped gracefully");
        }
        summary
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) { self.shutdown(); }
}
