//! The flush scheduler drives time through the pipeline.
//!
//! Every `flush_interval`, or as soon as the oldest open window's end is
//! reached if that comes first, the scheduler swaps the closed windows out
//! of the engine and delivers each one to the sink. The engine lock is held
//! for the swap only. Delivery retries with exponential backoff and, when
//! retries run out, falls back to the spill store or records the snapshot
//! as lost according to the durability policy.

use crate::buckets::{self, Engine, Snapshot};
use crate::internal::Registry;
use crate::sink::Sink;
use crate::spill::Spill;
use crate::thread::Stop;
use crate::time;
use std::cmp;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest the scheduler sleeps between looking at the clock and its stop
/// signal.
const POLL: Duration = Duration::from_millis(50);

/// What happens to a snapshot the sink would not take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityPolicy {
    /// Count it as lost.
    Drop,
    /// Write it to the spill store.
    Spill,
}

impl DurabilityPolicy {
    /// Parse `drop` or `spill`, case-insensitively.
    pub fn parse(s: &str) -> Option<DurabilityPolicy> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Some(DurabilityPolicy::Drop),
            "spill" => Some(DurabilityPolicy::Spill),
            _ => None,
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushConfig {
    /// Wall-clock flush tick.
    pub flush_interval: Duration,
    /// Export retries after the first attempt.
    pub retry_count: u32,
    /// Backoff before the first retry. Doubles per retry.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Fallback for snapshots that exhaust their retries.
    pub durability: DurabilityPolicy,
    /// Bound on the final flush at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> FlushConfig {
        FlushConfig {
            flush_interval: Duration::from_secs(10),
            retry_count: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            durability: DurabilityPolicy::Drop,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// No open windows.
    Idle,
    /// Open windows are accumulating.
    Collecting,
    /// Closed windows are being exported.
    Flushing,
}

impl FlushState {
    /// Lowercase name, for health output.
    pub fn as_str(self) -> &'static str {
        match self {
            FlushState::Idle => "idle",
            FlushState::Collecting => "collecting",
            FlushState::Flushing => "flushing",
        }
    }

    fn from_usize(v: usize) -> FlushState {
        match v {
            1 => FlushState::Collecting,
            2 => FlushState::Flushing,
            _ => FlushState::Idle,
        }
    }

    fn to_usize(self) -> usize {
        match self {
            FlushState::Idle => 0,
            FlushState::Collecting => 1,
            FlushState::Flushing => 2,
        }
    }
}

impl fmt::Display for FlushState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of the scheduler's `FlushState`.
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    inner: Arc<AtomicUsize>,
}

impl StateCell {
    /// The current state.
    pub fn get(&self) -> FlushState {
        FlushState::from_usize(self.inner.load(Ordering::Acquire))
    }

    fn set(&self, state: FlushState) {
        self.inner.store(state.to_usize(), Ordering::Release);
    }
}

/// The fate of one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The sink took it.
    Exported {
        /// Attempts made, the successful one included.
        attempts: u32,
    },
    /// The sink never took it; it is on disk.
    Spilled {
        /// Failed attempts made.
        attempts: u32,
        /// The spill file.
        path: PathBuf,
    },
    /// The sink never took it and it was not spilled.
    Lost {
        /// Failed attempts made.
        attempts: u32,
    },
}

/// Tally of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Windows taken from the engine.
    pub windows: usize,
    /// Snapshots the sink accepted.
    pub exported: usize,
    /// Snapshots written to the spill store.
    pub spilled: usize,
    /// Snapshots lost.
    pub lost: usize,
}

impl FlushReport {
    fn count(&mut self, delivery: &Delivery) {
        match *delivery {
            Delivery::Exported { .. } => self.exported += 1,
            Delivery::Spilled { .. } => self.spilled += 1,
            Delivery::Lost { .. } => self.lost += 1,
        }
    }
}

/// Moves closed windows from the engine to the sink.
pub struct FlushScheduler {
    engine: Engine,
    sink: Box<dyn Sink>,
    spill: Option<Spill>,
    config: FlushConfig,
    registry: Arc<Registry>,
    state: StateCell,
}

impl FlushScheduler {
    /// Create a scheduler. `spill` is consulted only under the spill policy;
    /// without one, exhausted snapshots are lost either way.
    pub fn new(
        engine: Engine,
        sink: Box<dyn Sink>,
        spill: Option<Spill>,
        config: FlushConfig,
        registry: Arc<Registry>,
    ) -> FlushScheduler {
        FlushScheduler {
            engine,
            sink,
            spill,
            config,
            registry,
            state: StateCell::default(),
        }
    }

    /// A handle on the scheduler's state, readable from other threads.
    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    fn settle(&self) {
        let idle = buckets::lock(&self.engine).is_empty();
        self.state.set(if idle {
            FlushState::Idle
        } else {
            FlushState::Collecting
        });
    }

    /// Flush every window closed as of `now`.
    pub fn tick(&mut self, now: i64) -> FlushReport {
        self.state.set(FlushState::Flushing);
        let snapshots = buckets::lock(&self.engine).take_closed(now);
        let mut report = FlushReport {
            windows: snapshots.len(),
            ..Default::default()
        };
        for snapshot in &snapshots {
            let delivery = self.deliver(snapshot, None);
            report.count(&delivery);
        }
        if report.windows > 0 {
            debug!(
                "flushed {} windows: {} exported, {} spilled, {} lost",
                report.windows, report.exported, report.spilled, report.lost
            );
        }
        self.settle();
        report
    }

    /// Export `snapshot`, retrying per config. With a `deadline`, no retry
    /// starts that could not begin before it.
    pub fn deliver(&mut self, snapshot: &Snapshot, deadline: Option<Instant>) -> Delivery {
        let mut attempts = 0;
        for attempt in 0..=self.config.retry_count {
            let pause = time::backoff(self.config.backoff_base, self.config.backoff_max, attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + pause >= deadline {
                    break;
                }
            }
            if attempt > 0 {
                thread::sleep(pause);
            }
            attempts += 1;
            match self.sink.export(snapshot) {
                Ok(()) => {
                    self.registry.flushed_at(time::now_ms());
                    trace!(
                        "{} took window {} on attempt {}",
                        self.sink.name(),
                        snapshot.window.start,
                        attempts
                    );
                    return Delivery::Exported { attempts };
                }
                Err(e) => {
                    self.registry.flush_failure.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{} failed window {} (attempt {}): {}",
                        self.sink.name(),
                        snapshot.window.start,
                        attempts,
                        e
                    );
                }
            }
        }
        self.fall_back(snapshot, attempts)
    }

    fn fall_back(&self, snapshot: &Snapshot, attempts: u32) -> Delivery {
        if self.config.durability == DurabilityPolicy::Spill {
            if let Some(ref spill) = self.spill {
                match spill.write(snapshot) {
                    Ok(path) => {
                        self.registry.spilled.fetch_add(1, Ordering::Relaxed);
                        info!("spilled window {} to {:?}", snapshot.window.start, path);
                        return Delivery::Spilled { attempts, path };
                    }
                    Err(e) => {
                        warn!("could not spill window {}: {}", snapshot.window.start, e);
                    }
                }
            }
        }
        self.registry.export_loss.fetch_add(1, Ordering::Relaxed);
        warn!(
            "lost window {} with {} series after {} attempts",
            snapshot.window.start,
            snapshot.series.len(),
            attempts
        );
        Delivery::Lost { attempts }
    }

    /// Flush everything, open windows included, within `timeout`. Snapshots
    /// the sink has not taken by then are spilled or lost.
    pub fn final_flush(&mut self, now: i64, timeout: Duration) -> FlushReport {
        self.state.set(FlushState::Flushing);
        let deadline = Instant::now() + timeout;
        let snapshots = {
            let mut engine = buckets::lock(&self.engine);
            let mut snapshots = engine.take_closed(now);
            snapshots.extend(engine.take_all());
            snapshots
        };
        let mut report = FlushReport {
            windows: snapshots.len(),
            ..Default::default()
        };
        for snapshot in &snapshots {
            let delivery = self.deliver(snapshot, Some(deadline));
            report.count(&delivery);
        }
        if report.lost > 0 {
            error!(
                "final flush lost {} of {} windows",
                report.lost, report.windows
            );
        } else {
            info!(
                "final flush: {} exported, {} spilled",
                report.exported, report.spilled
            );
        }
        self.state.set(FlushState::Idle);
        report
    }

    /// Flush on schedule until `stop` is raised, then run the final flush.
    pub fn run(mut self, stop: Stop) {
        let interval = cmp::max(time::duration_ms(self.config.flush_interval), 1);
        let mut next_tick = time::now_ms().saturating_add(interval);
        while !stop.is_raised() {
            let now = time::now_ms();
            let next_close = buckets::lock(&self.engine).next_close();
            let due = match next_close {
                Some(close) => cmp::min(close, next_tick),
                None => next_tick,
            };
            if now >= due {
                self.tick(now);
                if now >= next_tick {
                    next_tick = now.saturating_add(interval);
                }
            } else {
                self.settle();
                let wait = Duration::from_millis((due - now) as u64);
                thread::sleep(cmp::min(wait, POLL));
            }
        }
        let timeout = self.config.shutdown_timeout;
        self.final_flush(time::now_ms(), timeout);
    }
}
