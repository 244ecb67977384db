//! Self-telemetry.
//!
//! Every component reports on itself through a shared `Registry` handle:
//! records accepted and rejected, buffer pressure, aggregation drops, flush
//! outcomes. The registry is created once at startup and handed to each
//! component; nothing here is a global. `Registry::read` produces a
//! point-in-time view for the metrics endpoint and `Registry::reset` zeroes
//! the counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Why the validator turned a record away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The metric name was empty.
    EmptyName,
    /// The metric name did not match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
    InvalidName,
    /// The kind was not counter, gauge or histogram.
    UnknownKind,
    /// The value was NaN or infinite.
    NonFinite,
    /// A label name did not match `[a-zA-Z_][a-zA-Z0-9_]*`.
    InvalidLabel,
    /// The timestamp was too far from the current time.
    ClockSkew,
}

impl RejectReason {
    /// Every reason, in reporting order.
    pub const ALL: [RejectReason; 6] = [
        RejectReason::EmptyName,
        RejectReason::InvalidName,
        RejectReason::UnknownKind,
        RejectReason::NonFinite,
        RejectReason::InvalidLabel,
        RejectReason::ClockSkew,
    ];

    /// The label value used when reporting this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::EmptyName => "empty_name",
            RejectReason::InvalidName => "invalid_name",
            RejectReason::UnknownKind => "unknown_kind",
            RejectReason::NonFinite => "non_finite",
            RejectReason::InvalidLabel => "invalid_label",
            RejectReason::ClockSkew => "clock_skew",
        }
    }

    fn index(self) -> usize {
        match self {
            RejectReason::EmptyName => 0,
            RejectReason::InvalidName => 1,
            RejectReason::UnknownKind => 2,
            RejectReason::NonFinite => 3,
            RejectReason::InvalidLabel => 4,
            RejectReason::ClockSkew => 5,
        }
    }
}

/// Operational counters shared across the pipeline.
///
/// Counters are bumped with relaxed atomics; readers get a consistent value
/// per counter, not a consistent cut across all of them.
#[derive(Debug, Default)]
pub struct Registry {
    /// Records that passed validation.
    pub records_validated: AtomicUsize,
    rejected: [AtomicUsize; 6],
    /// Enqueues refused because the buffer was at capacity.
    pub buffer_full: AtomicUsize,
    /// Enqueues refused because the buffer was closed for shutdown.
    pub buffer_closed: AtomicUsize,
    /// Records currently held in the buffer.
    pub buffer_occupancy: AtomicUsize,
    /// Configured buffer capacity.
    pub buffer_capacity: AtomicUsize,
    /// Records folded into an aggregate.
    pub records_aggregated: AtomicUsize,
    /// Counter records refused for a negative delta.
    pub invalid_counter_delta: AtomicUsize,
    /// Records dropped because their window was already flushed.
    pub late_arrival_dropped: AtomicUsize,
    /// Late records folded into the oldest open window instead.
    pub late_arrival_merged: AtomicUsize,
    /// Records whose kind disagreed with their series.
    pub kind_mismatch: AtomicUsize,
    /// Snapshots the sink accepted.
    pub flush_success: AtomicUsize,
    /// Failed export attempts, retries included.
    pub flush_failure: AtomicUsize,
    /// Snapshots neither exported nor spilled.
    pub export_loss: AtomicUsize,
    /// Snapshots written to the spill store.
    pub spilled: AtomicUsize,
    /// Hits on the ingest dry-run endpoint.
    pub ingest_requests: AtomicUsize,
    /// Epoch milliseconds of the last successful export, zero if none yet.
    pub last_flush_ms: AtomicI64,
}

/// Whether a sample only goes up or can move both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Monotonic, reset only by `Registry::reset`.
    Counter,
    /// Point-in-time.
    Gauge,
}

/// One reading out of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Exposition name.
    pub name: &'static str,
    /// One-line description.
    pub help: &'static str,
    /// Counter or gauge.
    pub kind: SampleKind,
    /// Label pairs, possibly empty.
    pub labels: Vec<(&'static str, &'static str)>,
    /// The reading.
    pub value: f64,
}

impl Registry {
    /// Create a registry with every counter at zero.
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    /// Count one rejected record.
    pub fn reject(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Total rejections for `reason`.
    pub fn rejected(&self, reason: RejectReason) -> usize {
        self.rejected[reason.index()].load(Ordering::Relaxed)
    }

    /// Total rejections across every reason.
    pub fn rejected_total(&self) -> usize {
        self.rejected
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Record a successful export at `now_ms`.
    pub fn flushed_at(&self, now_ms: i64) {
        self.flush_success.fetch_add(1, Ordering::Relaxed);
        self.last_flush_ms.store(now_ms, Ordering::Relaxed);
    }

    /// The last successful export, if there has been one.
    pub fn last_flush(&self) -> Option<i64> {
        match self.last_flush_ms.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Zero every counter. Gauges (buffer occupancy and capacity, last flush
    /// time) describe current state and are left alone.
    pub fn reset(&self) {
        let counters = [
            &self.records_validated,
            &self.buffer_full,
            &self.buffer_closed,
            &self.records_aggregated,
            &self.invalid_counter_delta,
            &self.late_arrival_dropped,
            &self.late_arrival_merged,
            &self.kind_mismatch,
            &self.flush_success,
            &self.flush_failure,
            &self.export_loss,
            &self.spilled,
            &self.ingest_requests,
        ];
        for c in counters.iter() {
            c.store(0, Ordering::Relaxed);
        }
        for c in self.rejected.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// A point-in-time reading of every counter and gauge.
    pub fn read(&self) -> Vec<Sample> {
        fn load(c: &AtomicUsize) -> f64 {
            c.load(Ordering::Relaxed) as f64
        }
        let mut samples = Vec::with_capacity(32);
        samples.push(Sample {
            name: "telemetryhub_records_validated_total",
            help: "Records that passed validation.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.records_validated),
        });
        for reason in RejectReason::ALL.iter() {
            samples.push(Sample {
                name: "telemetryhub_records_rejected_total",
                help: "Records rejected by the validator.",
                kind: SampleKind::Counter,
                labels: vec![("reason", reason.as_str())],
                value: self.rejected(*reason) as f64,
            });
        }
        samples.push(Sample {
            name: "telemetryhub_buffer_rejected_total",
            help: "Enqueues refused by the ingestion buffer.",
            kind: SampleKind::Counter,
            labels: vec![("reason", "full")],
            value: load(&self.buffer_full),
        });
        samples.push(Sample {
            name: "telemetryhub_buffer_rejected_total",
            help: "Enqueues refused by the ingestion buffer.",
            kind: SampleKind::Counter,
            labels: vec![("reason", "closed")],
            value: load(&self.buffer_closed),
        });
        samples.push(Sample {
            name: "telemetryhub_buffer_occupancy",
            help: "Records waiting in the ingestion buffer.",
            kind: SampleKind::Gauge,
            labels: vec![],
            value: load(&self.buffer_occupancy),
        });
        samples.push(Sample {
            name: "telemetryhub_buffer_capacity",
            help: "Capacity of the ingestion buffer.",
            kind: SampleKind::Gauge,
            labels: vec![],
            value: load(&self.buffer_capacity),
        });
        samples.push(Sample {
            name: "telemetryhub_records_aggregated_total",
            help: "Records folded into a window aggregate.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.records_aggregated),
        });
        for &(reason, counter) in &[
            ("invalid_counter_delta", &self.invalid_counter_delta),
            ("late_arrival", &self.late_arrival_dropped),
            ("kind_mismatch", &self.kind_mismatch),
        ] {
            samples.push(Sample {
                name: "telemetryhub_aggregation_dropped_total",
                help: "Records dropped by the aggregation engine.",
                kind: SampleKind::Counter,
                labels: vec![("reason", reason)],
                value: load(counter),
            });
        }
        samples.push(Sample {
            name: "telemetryhub_late_arrivals_merged_total",
            help: "Late records merged into the oldest open window.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.late_arrival_merged),
        });
        samples.push(Sample {
            name: "telemetryhub_flush_success_total",
            help: "Window snapshots accepted by the export sink.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.flush_success),
        });
        samples.push(Sample {
            name: "telemetryhub_flush_failure_total",
            help: "Failed export attempts, retries included.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.flush_failure),
        });
        samples.push(Sample {
            name: "telemetryhub_export_loss_total",
            help: "Window snapshots neither exported nor spilled.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.export_loss),
        });
        samples.push(Sample {
            name: "telemetryhub_snapshots_spilled_total",
            help: "Window snapshots written to the local spill store.",
            kind: SampleKind::Counter,
            labels: vec![],
            value: load(&self.spilled),
        });
        samples.push(Sample {
            name: "telemetryhub_last_flush_timestamp_ms",
            help: "Epoch milliseconds of the last successful export.",
            kind: SampleKind::Gauge,
            labels: vec![],
            value: self.last_flush_ms.load(Ordering::Relaxed) as f64,
        });
        samples.push(Sample {
            name: "telemetry_ingest_requests_total",
            help: "Total number of telemetry ingest requests",
            kind: SampleKind::Counter,
            labels: vec![("type", "metric")],
            value: load(&self.ingest_requests),
        });
        samples
    }

    /// Render `read()` in the Prometheus text exposition format.
    pub fn expose(&self) -> String {
        let mut out = String::with_capacity(4096);
        let mut last_name = "";
        for sample in self.read() {
            if sample.name != last_name {
                let kind = match sample.kind {
                    SampleKind::Counter => "counter",
                    SampleKind::Gauge => "gauge",
                };
                let _ = writeln!(out, "# HELP {} {}", sample.name, sample.help);
                let _ = writeln!(out, "# TYPE {} {}", sample.name, kind);
                last_name = sample.name;
            }
            out.push_str(sample.name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, &(k, v)) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", k, v);
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", sample.value);
        }
        out
    }
}
