//! End-to-end runs of the threaded pipeline with shortened timings.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use sim_trader::config::{FeedSettings, PipelineSettings, Timings};
use sim_trader::coordinator::{Phase, ShutdownCoordinator, StopReason};
use sim_trader::domain::{ActionSignal, TradeData};
use sim_trader::engine::StrategyEngine;
use sim_trader::executor::TradeExecutor;
use sim_trader::queue::SafeQueue;
use sim_trader::recorder::EventSink;
use sim_trader::state::SystemState;
use sim_trader::strategy::StrategyMode;

fn fast_timings() -> Timings {
    Timings {
        queue_wait: Duration::from_millis(200),
        throttle: Duration::from_millis(1),
        tick_interval: Duration::from_millis(5),
        recv_timeout: Duration::from_millis(100),
        accept_poll: Duration::from_millis(10),
        monitor_interval: Duration::from_millis(20),
        flush_interval: Duration::from_millis(50),
    }
}

fn generator(fault_after_ticks: Option<u64>) -> PipelineSettings {
    PipelineSettings {
        feed: FeedSettings::Generator { seed: Some(42), fault_after_ticks },
        max_history: 30,
        min_history: 6,
        run_duration: None,
        timings: fast_timings(),
        ..PipelineSettings::default()
    }
}

fn socket() -> PipelineSettings {
    PipelineSettings {
        feed: FeedSettings::Socket { listen_addr: "127.0.0.1:0".parse().unwrap() },
        max_history: 10,
        min_history: 5,
        strategy: StrategyMode::Sma,
        ..generator(None)
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn injected_fault_stops_everything_as_fatal() {
    let started = Instant::now();
    let coordinator = ShutdownCoordinator::start(generator(Some(5))).unwrap();
    let state = coordinator.state();
    let summary = coordinator.run();

    assert_eq!(summary.reason, StopReason::Fatal);
    assert!(state.is_broken());
    assert!(!state.is_running());
    assert!(summary.to_string().contains("critical error"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn stop_file_triggers_graceful_stop() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("stop");
    let settings = PipelineSettings { stop_file: Some(marker.clone()), ..generator(None) };

    let coordinator = ShutdownCoordinator::start(settings).unwrap();
    let writer = std::thread::spawn(move || {
        sleep(Duration::from_millis(100));
        std::fs::write(&marker, b"").unwrap();
    });
    let summary = coordinator.run();
    writer.join().unwrap();

    assert_eq!(summary.reason, StopReason::StopFile);
    assert!(!summary.reason.is_fatal());
    assert!(summary.to_string().contains("gracefully"));
}

#[test]
fn socket_ticks_flow_through_to_the_portfolio() {
    let dir = tempfile::tempdir().unwrap();
    let record = dir.path().join("events.jsonl");
    let settings = PipelineSettings { record_file: Some(record.clone()), initial_cash: 1_000.0, ..socket() };

    let coordinator = ShutdownCoordinator::start(settings).unwrap();
    let addr = coordinator.feed_addr().expect("socket feed is bound");
    let executor = coordinator.executor();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"not json\n").unwrap();
    for price in [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 20.0] {
        writeln!(client, r#"{{"symbol":"ETH","price":{price},"timestamp":1700000000}}"#).unwrap();
    }
    client.flush().unwrap();

    assert!(wait_until(Duration::from_secs(5), || executor.snapshot().total_buys == 1));
    drop(client);

    coordinator.interrupt_flag().store(true, Ordering::Release);
    let summary = coordinator.run();
    assert_eq!(summary.reason, StopReason::Interrupted);

    let p = summary.report.portfolio;
    assert_eq!(p.total_trades, 1);
    assert!((p.cash - (1_000.0 - 20.0 * 0.01)).abs() < 1e-9);
    assert!((p.asset_units - 0.01).abs() < 1e-12);
    assert_eq!(summary.report.price, 20.0);

    let text = std::fs::read_to_string(&record).unwrap();
    let kinds: Vec<String> = text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["kind"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds.iter().filter(|k| *k == "tick").count(), 7);
    assert!(kinds.contains(&"signal".to_string()));
    assert!(kinds.contains(&"fill".to_string()));
}

#[test]
fn shutdown_unblocks_idle_stages_and_connection() {
    let settings = PipelineSettings {
        timings: Timings { queue_wait: Duration::from_secs(30), recv_timeout: Duration::from_secs(30), ..fast_timings() },
        ..socket()
    };
    let mut coordinator = ShutdownCoordinator::start(settings).unwrap();
    let _client = TcpStream::connect(coordinator.feed_addr().unwrap()).unwrap();
    sleep(Duration::from_millis(200));

    let started = Instant::now();
    coordinator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(coordinator.phase(), Phase::Stopped);

    coordinator.shutdown();
    assert_eq!(coordinator.phase(), Phase::Stopped);
}

#[test]
fn occupied_listen_address_fails_startup() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let settings = PipelineSettings {
        feed: FeedSettings::Socket { listen_addr: holder.local_addr().unwrap() },
        ..socket()
    };
    assert!(ShutdownCoordinator::start(settings).is_err());
}

#[test]
fn broken_flag_alone_releases_stages_parked_on_empty_queues() {
    let wait = Duration::from_millis(300);
    let throttle = Duration::from_millis(1);
    let state = Arc::new(SystemState::new());
    let market: Arc<SafeQueue<TradeData>> = Arc::new(SafeQueue::new());
    let signals: Arc<SafeQueue<ActionSignal>> = Arc::new(SafeQueue::new());

    let engine = StrategyEngine::new(StrategyMode::Sma.build(), 10, 5, signals.clone(), EventSink::disabled());
    let executor = Arc::new(TradeExecutor::new(1_000.0, EventSink::disabled()));

    let strategy = {
        let (state, market) = (state.clone(), market.clone());
        std::thread::spawn(move || engine.run(state, market, wait, throttle))
    };
    let exec = {
        let (state, signals) = (state.clone(), signals.clone());
        std::thread::spawn(move || executor.run(state, signals, wait, throttle))
    };
    sleep(Duration::from_millis(50));

    // no request_stop, no wake_all: the bounded waits alone must notice
    let started = Instant::now();
    state.mark_broken("upstream failure");
    strategy.join().unwrap();
    exec.join().unwrap();

    assert!(state.is_running());
    assert!(started.elapsed() < wait + Duration::from_millis(500));
}
