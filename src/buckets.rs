//! Buckets are the primary internal storage type.
//!
//! Records are folded into per-series aggregates inside fixed, non-overlapping
//! time windows. A window is open until the flush scheduler takes it; from
//! then on it exists only as an owned `Snapshot` and nothing in here can
//! reach it again. The end of the newest taken window is the watermark, and
//! records that would land behind it are either merged forward into the
//! oldest open window or dropped, depending on how late they are.

use crate::internal::Registry;
use crate::metric::{Kind, SeriesKey, TagMap, TelemetryRecord};
use crate::time;
use quantiles::histogram::{Bound, Histogram};
use regex::Regex;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cmp;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::error;
use std::f64;
use std::fmt;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Why the engine refused a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationError {
    /// A counter record carried a negative delta.
    InvalidCounterDelta,
    /// The record's window was already flushed and the record was too late
    /// to merge forward.
    LateArrivalDropped,
    /// The series already aggregates a different kind in this window.
    KindMismatch,
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AggregationError::InvalidCounterDelta => write!(f, "negative counter delta"),
            AggregationError::LateArrivalDropped => {
                write!(f, "record arrived after its window was flushed")
            }
            AggregationError::KindMismatch => write!(f, "kind differs from existing series"),
        }
    }
}

impl error::Error for AggregationError {}

/// What `Buckets::apply` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Folded into the window that contains its timestamp.
    Applied {
        /// Start of the window, epoch milliseconds.
        window_start: i64,
    },
    /// Its own window was already flushed; folded into the oldest open
    /// window instead.
    MergedLate {
        /// Start of the window it was merged into.
        window_start: i64,
    },
    /// Not aggregated.
    Dropped(AggregationError),
}

/// A half-open time interval `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    /// Inclusive start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
    /// True once the window has been handed out in a snapshot.
    pub flushed: bool,
}

impl Window {
    /// The window of width `size` that contains `ts`.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetryhub::buckets::Window;
    ///
    /// let w = Window::containing(61_500, 60_000);
    /// assert_eq!((60_000, 120_000), (w.start, w.end));
    ///
    /// let w = Window::containing(-1, 60_000);
    /// assert_eq!((-60_000, 0), (w.start, w.end));
    /// ```
    pub fn containing(ts: i64, size: i64) -> Window {
        let size = cmp::max(size, 1);
        let start = ts.div_euclid(size) * size;
        Window {
            start,
            end: start.saturating_add(size),
            flushed: false,
        }
    }

    /// True if `ts` falls inside the window.
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// A problem with configured histogram bounds.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundsError {
    /// No bounds were given.
    Empty,
    /// A bound was NaN or infinite. `+Inf` is always implied.
    NonFinite(f64),
    /// A mask pattern failed to compile.
    BadMask(String),
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BoundsError::Empty => write!(f, "histogram bounds are empty"),
            BoundsError::NonFinite(b) => write!(f, "histogram bound {} is not finite", b),
            BoundsError::BadMask(ref e) => write!(f, "bad histogram mask: {}", e),
        }
    }
}

impl error::Error for BoundsError {}

/// The bucket bounds Prometheus clients default to.
pub const DEFAULT_BOUNDS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn prototype(bounds: &[f64]) -> Result<Histogram<f64>, BoundsError> {
    if bounds.is_empty() {
        return Err(BoundsError::Empty);
    }
    if let Some(b) = bounds.iter().find(|b| !b.is_finite()) {
        return Err(BoundsError::NonFinite(*b));
    }
    let mut bounds = bounds.to_vec();
    bounds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal));
    bounds.dedup();
    Histogram::new(bounds).map_err(|_| BoundsError::Empty)
}

/// Histogram bucket layout per metric name.
///
/// Each histogram series gets the bounds of the first mask whose pattern
/// matches its metric name, or the default bounds if none does.
#[derive(Debug, Clone)]
pub struct HistogramBounds {
    default: Histogram<f64>,
    masks: Vec<(Regex, Histogram<f64>)>,
}

impl HistogramBounds {
    /// Build from default bounds and `(pattern, bounds)` masks, in priority
    /// order. Bounds need not be sorted.
    pub fn new(default: &[f64], masks: &[(String, Vec<f64>)]) -> Result<HistogramBounds, BoundsError> {
        let default = prototype(default)?;
        let mut compiled = Vec::with_capacity(masks.len());
        for &(ref pattern, ref bounds) in masks {
            let re = Regex::new(pattern).map_err(|e| BoundsError::BadMask(e.to_string()))?;
            compiled.push((re, prototype(bounds)?));
        }
        Ok(HistogramBounds {
            default,
            masks: compiled,
        })
    }

    /// An empty histogram laid out for `name`.
    pub fn for_name(&self, name: &str) -> Histogram<f64> {
        for &(ref re, ref hist) in &self.masks {
            if re.is_match(name) {
                return hist.clone();
            }
        }
        self.default.clone()
    }
}

impl Default for HistogramBounds {
    fn default() -> HistogramBounds {
        HistogramBounds {
            default: Histogram::new(DEFAULT_BOUNDS.to_vec())
                .expect("default bounds are sorted and non-empty"),
            masks: Vec::new(),
        }
    }
}

/// One histogram bucket: the count of samples no greater than `le` and
/// greater than the previous bucket's bound. `le` of `None` is `+Inf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Upper bound, inclusive. `None` is the implicit `+Inf` bucket.
    pub le: Option<f64>,
    /// Samples in this bucket.
    pub count: usize,
}

impl Serialize for Bucket {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("Bucket", 2)?;
        match self.le {
            Some(le) => st.serialize_field("le", &le)?,
            None => st.serialize_field("le", "+Inf")?,
        }
        st.serialize_field("count", &self.count)?;
        st.end()
    }
}

/// The running aggregate of one series in one window.
#[derive(Debug, Clone)]
pub struct AggregateState {
    kind: Kind,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    last_timestamp: i64,
    histogram: Option<Histogram<f64>>,
}

impl AggregateState {
    fn new(kind: Kind, histogram: Option<Histogram<f64>>) -> AggregateState {
        AggregateState {
            kind,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            last_timestamp: i64::min_value(),
            histogram,
        }
    }

    fn record(&mut self, value: f64, timestamp: i64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        // ties go to the later arrival
        if timestamp >= self.last_timestamp {
            self.last = value;
            self.last_timestamp = timestamp;
        }
        if let Some(ref mut hist) = self.histogram {
            hist.insert(value);
        }
    }

    /// The kind being aggregated.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Accepted samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of accepted samples. For a counter this is the window's total.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Smallest accepted sample.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest accepted sample.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// The sample with the latest timestamp. For a gauge this is its value.
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Timestamp of `last`.
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    /// Per-bucket counts in bound order, ending with `+Inf`. Empty unless
    /// the kind is histogram.
    pub fn buckets(&self) -> Vec<Bucket> {
        match self.histogram {
            None => Vec::new(),
            Some(ref hist) => hist
                .iter()
                .map(|&(ref bound, count)| Bucket {
                    le: match *bound {
                        Bound::Finite(le) => Some(le),
                        Bound::PosInf => None,
                    },
                    count,
                })
                .collect(),
        }
    }
}

impl Serialize for AggregateState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("AggregateState", 8)?;
        st.serialize_field("kind", &self.kind)?;
        st.serialize_field("count", &self.count)?;
        st.serialize_field("sum", &self.sum)?;
        st.serialize_field("min", &self.min)?;
        st.serialize_field("max", &self.max)?;
        st.serialize_field("last", &self.last)?;
        st.serialize_field("last_timestamp", &self.last_timestamp)?;
        st.serialize_field("buckets", &self.buckets())?;
        st.end()
    }
}

/// One series of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesAggregate {
    /// The series identity.
    pub key: SeriesKey,
    /// Metric name.
    pub name: String,
    /// Label set.
    pub labels: TagMap,
    /// The aggregate.
    pub state: AggregateState,
}

/// A flushed window and everything aggregated in it, sorted by series key.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// The window, with `flushed` set.
    pub window: Window,
    /// Series in key order.
    pub series: Vec<SeriesAggregate>,
}

impl Snapshot {
    /// Look up a series by key.
    pub fn get(&self, key: &SeriesKey) -> Option<&SeriesAggregate> {
        self.series
            .binary_search_by(|probe| probe.key.cmp(key))
            .ok()
            .map(|idx| &self.series[idx])
    }
}

#[derive(Debug)]
struct Series {
    name: String,
    labels: TagMap,
    state: AggregateState,
}

#[derive(Debug)]
struct OpenWindow {
    window: Window,
    series: BTreeMap<SeriesKey, Series>,
}

impl OpenWindow {
    fn seal(self) -> Snapshot {
        let mut window = self.window;
        window.flushed = true;
        Snapshot {
            window,
            series: self
                .series
                .into_iter()
                .map(|(key, s)| SeriesAggregate {
                    key,
                    name: s.name,
                    labels: s.labels,
                    state: s.state,
                })
                .collect(),
        }
    }
}

/// Buckets stores all aggregates until they are flushed.
#[derive(Debug)]
pub struct Buckets {
    window_size: i64,
    late_tolerance: i64,
    bounds: HistogramBounds,
    windows: BTreeMap<i64, OpenWindow>,
    watermark: Option<i64>,
    registry: Arc<Registry>,
}

impl Buckets {
    /// Create an empty engine. A zero window size is treated as one
    /// millisecond.
    pub fn new(
        window_size: Duration,
        late_tolerance: Duration,
        bounds: HistogramBounds,
        registry: Arc<Registry>,
    ) -> Buckets {
        Buckets {
            window_size: cmp::max(time::duration_ms(window_size), 1),
            late_tolerance: time::duration_ms(late_tolerance),
            bounds,
            windows: BTreeMap::new(),
            watermark: None,
            registry,
        }
    }

    /// Fold one record into its window.
    ///
    /// Errors are counted and reported in the outcome; none of them disturb
    /// the aggregates already held.
    pub fn apply(&mut self, record: TelemetryRecord) -> Outcome {
        let kind = record.kind();
        let value = record.value();
        let ts = record.timestamp();

        if kind == Kind::Counter && value < 0.0 {
            self.registry
                .invalid_counter_delta
                .fetch_add(1, Ordering::Relaxed);
            debug!("negative counter delta {} for {}", value, record.name());
            return Outcome::Dropped(AggregationError::InvalidCounterDelta);
        }

        let own = Window::containing(ts, self.window_size);
        let (start, late) = match self.watermark {
            Some(watermark) if own.start < watermark => {
                if ts >= watermark.saturating_sub(self.late_tolerance) {
                    let oldest = self.windows.keys().next().cloned();
                    (oldest.unwrap_or(watermark), true)
                } else {
                    self.registry
                        .late_arrival_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "dropping late record {} at {}, watermark {}",
                        record.name(),
                        ts,
                        watermark
                    );
                    return Outcome::Dropped(AggregationError::LateArrivalDropped);
                }
            }
            _ => (own.start, false),
        };

        let window_size = self.window_size;
        let window = self.windows.entry(start).or_insert_with(|| OpenWindow {
            window: Window::containing(start, window_size),
            series: BTreeMap::new(),
        });
        match window.series.entry(record.series_key()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().state.kind;
                if existing != kind {
                    self.registry.kind_mismatch.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "{} is a {}, refusing {} sample",
                        entry.key(),
                        existing,
                        kind
                    );
                    return Outcome::Dropped(AggregationError::KindMismatch);
                }
                entry.get_mut().state.record(value, ts);
            }
            Entry::Vacant(entry) => {
                let (name, labels) = record.into_name_labels();
                let histogram = match kind {
                    Kind::Histogram => Some(self.bounds.for_name(&name)),
                    _ => None,
                };
                let mut state = AggregateState::new(kind, histogram);
                state.record(value, ts);
                entry.insert(Series {
                    name,
                    labels,
                    state,
                });
            }
        }

        self.registry
            .records_aggregated
            .fetch_add(1, Ordering::Relaxed);
        if late {
            self.registry
                .late_arrival_merged
                .fetch_add(1, Ordering::Relaxed);
            Outcome::MergedLate {
                window_start: start,
            }
        } else {
            Outcome::Applied {
                window_start: start,
            }
        }
    }

    /// Remove every window whose end is at or before `now` and hand them
    /// out as snapshots, oldest first. The watermark advances past them.
    pub fn take_closed(&mut self, now: i64) -> Vec<Snapshot> {
        let cutoff = now.saturating_sub(self.window_size).saturating_add(1);
        let open = self.windows.split_off(&cutoff);
        let closed = mem::replace(&mut self.windows, open);
        self.seal(closed)
    }

    /// Remove every window, open or not. Used at shutdown.
    pub fn take_all(&mut self) -> Vec<Snapshot> {
        let all = mem::replace(&mut self.windows, BTreeMap::new());
        self.seal(all)
    }

    fn seal(&mut self, windows: BTreeMap<i64, OpenWindow>) -> Vec<Snapshot> {
        let mut snapshots = Vec::with_capacity(windows.len());
        for (_, open) in windows {
            let end = open.window.end;
            self.watermark = Some(match self.watermark {
                Some(w) => cmp::max(w, end),
                None => end,
            });
            snapshots.push(open.seal());
        }
        snapshots
    }

    /// The end of the oldest open window, if any.
    pub fn next_close(&self) -> Option<i64> {
        self.windows.values().next().map(|w| w.window.end)
    }

    /// The currently open windows, oldest first.
    pub fn open_windows(&self) -> Vec<Window> {
        self.windows.values().map(|w| w.window).collect()
    }

    /// Total series across open windows.
    pub fn series_count(&self) -> usize {
        self.windows.values().map(|w| w.series.len()).sum()
    }

    /// The end of the newest flushed window, if anything has been flushed.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// True if no window is open.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Window width in milliseconds.
    pub fn window_size(&self) -> i64 {
        self.window_size
    }
}

/// The engine as shared between the consumer and the flush scheduler.
pub type Engine = Arc<Mutex<Buckets>>;

/// Lock the engine. A panic while holding the lock cannot leave a window
/// half-swapped, since `take_closed` swaps whole maps, so poisoning is
/// ignored.
pub fn lock(engine: &Mutex<Buckets>) -> MutexGuard<Buckets> {
    match engine.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
