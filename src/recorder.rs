// ===============================
// src/recorder.rs
// ===============================
//
// Lightweight JSONL recorder:
// - every Event is written as one JSON line (append)
// - BufWriter to save syscalls
// - flush every `flush_interval` and/or every 1000 events
// - parent directory created if missing
// - on write failure, reopen the file once and carry on
// - stops on its own latch, after the producers; the queue is then drained
//   and flushed before the thread exits
//
// Enabled with `RECORD_FILE=/path/to/events.jsonl`.
//
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::domain::Event;
use crate::queue::SafeQueue;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

/// Producer-side handle. A disabled sink drops events.
#[derive(Clone, Debug, Default)]
pub struct EventSink(Option<Arc<SafeQueue<Event>>>);

impl EventSink {
    pub fn disabled() -> Self { Self(None) }

    pub fn new(queue: Arc<SafeQueue<Event>>) -> Self { Self(Some(queue)) }

    pub fn record(&self, ev: Event) {
        if let Some(q) = &self.0 {
            q.push(ev);
        }
    }

    pub fn is_enabled(&self) -> bool { self.0.is_some() }
}

fn open_writer(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

pub struct Recorder {
    path: PathBuf,
    writer: BufWriter<File>,
    since_last_flush: u32,
    written: u64,
}

impl Recorder {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let writer = open_writer(&path)?;
        Ok(Self { path, writer, since_last_flush: 0, written: 0 })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.writer.write_all(line)?;
        self.writer.write_all(b"\n")
    }

    pub fn write(&mut self, ev: &Event) {
        let line = match serde_json::to_vec(ev) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "recorder: serialize error, skip event");
                return;
            }
        };
        if let Err(e) = self.write_line(&line) {
            error!(error = %e, "recorder: write failed, attempting reopen");
            match open_writer(&self.path) {
                Ok(w) => self.writer = w,
                Err(e2) => {
                    error!(error = %e2, "recorder: reopen failed, drop event");
                    return;
                }
            }
            if let Err(e2) = self.write_line(&line) {
                error!(error = %e2, "recorder: write failed again after reopen, drop event");
                return;
            }
        }
        self.written += 1;
        self.since_last_flush += 1;
        if self.since_last_flush >= FLUSH_EVERY_N_EVENTS {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!(error = %e, "recorder: flush failed");
        }
        self.since_last_flush = 0;
    }

    /// Stage loop: bounded waits on the event queue until `stop` is set, then
    /// drain whatever is left. The coordinator sets `stop` only after every
    /// producer thread has been joined.
    pub fn run(mut self, stop: Arc<AtomicBool>, events: Arc<SafeQueue<Event>>, wait: Duration, flush_interval: Duration) {
        info!(path = %self.path.display(), "recorder: started");
        let stopped = || stop.load(Ordering::Acquire);
        let mut last_flush = Instant::now();
        while !stopped() {
            if let Some(ev) = events.pop_wait(wait, stopped) {
                self.write(&ev);
            }
            if last_flush.elapsed() >= flush_interval {
                self.flush();
                last_flush = Instant::now();
            }
        }
        for ev in events.drain() {
            self.write(&ev);
        }
        self.flush();
        info!(written = self.written, "recorder: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, ActionSignal, TradeData};
    use crate::state::SystemState;
    use std::thread;

    #[test]
    fn disabled_sink_is_a_no_op() {
        let sink = EventSink::disabled();
        assert!(!sink.is_enabled());
        sink.record(Event::Note { message: "dropped".into() });
    }

    fn spawn_recorder(path: &Path, events: &Arc<SafeQueue<Event>>) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let recorder = Recorder::open(path).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let events = events.clone();
            thread::spawn(move || recorder.run(stop, events, Duration::from_millis(20), Duration::from_millis(50)))
        };
        (stop, handle)
    }

    fn stop_recorder(stop: &AtomicBool, events: &SafeQueue<Event>, handle: thread::JoinHandle<()>) {
        stop.store(true, Ordering::Release);
        events.wake_all();
        handle.join().unwrap();
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path).unwrap().lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[test]
    fn writes_one_json_object_per_line_and_drains_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        let events = Arc::new(SafeQueue::new());
        let sink = EventSink::new(events.clone());
        let (stop, handle) = spawn_recorder(&path, &events);

        sink.record(Event::Tick(TradeData::at(101.5, 1_000, Some("BTC".into()))));
        sink.record(Event::Signal(ActionSignal::new(Action::Buy, 101.5, 0.01)));
        sink.record(Event::Note { message: "late".into() });
        // whatever is still queued at stop time lands through the final drain
        stop_recorder(&stop, &events, handle);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "tick");
        assert_eq!(lines[0]["price"], 101.5);
        assert_eq!(lines[1]["kind"], "signal");
        assert_eq!(lines[1]["action"], "BUY");
        assert_eq!(lines[2]["message"], "late");
        assert!(events.is_empty());
    }

    #[test]
    fn keeps_recording_after_the_pipeline_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let events = Arc::new(SafeQueue::new());
        let sink = EventSink::new(events.clone());
        let (stop, handle) = spawn_recorder(&path, &events);
        let state = SystemState::new();

        sink.record(Event::Note { message: "before".into() });
        state.mark_broken("test");
        thread::sleep(Duration::from_millis(60));
        // a stage finishing its current signal after the latch
        sink.record(Event::Fill { action: Action::Buy, price: 10.0, amount: 0.01, cash: 99.9, asset_units: 0.01 });
        stop_recorder(&stop, &events, handle);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["kind"], "fill");
        assert_eq!(lines[1]["cash"], 99.9);
        assert!(events.is_empty());
    }
}
