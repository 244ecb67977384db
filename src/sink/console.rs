//! Sink for human consumption. Prints each window to stdout.

use crate::buckets::{AggregateState, Snapshot};
use crate::metric::Kind;
use crate::sink::{ExportError, Sink};
use chrono::{TimeZone, Utc};
use std::fmt::Write as FmtWrite;
use std::io::{self, Write};

/// Configuration for the `Console` sink.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsoleConfig {
    /// The sink's name, as it appears in logs.
    pub config_path: String,
}

impl ConsoleConfig {
    /// Create a new `ConsoleConfig`.
    pub fn new(config_path: String) -> ConsoleConfig {
        ConsoleConfig { config_path }
    }
}

impl Default for ConsoleConfig {
    fn default() -> ConsoleConfig {
        ConsoleConfig::new("sinks.console".to_string())
    }
}

/// Console sink
///
/// Writes one block per window, grouped by kind.
pub struct Console {
    name: String,
}

impl Console {
    /// Create a new Console sink.
    pub fn new(config: &ConsoleConfig) -> Console {
        Console {
            name: config.config_path.clone(),
        }
    }
}

/// RFC3339 if chrono can represent `ms`, raw milliseconds otherwise.
fn fmt_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.to_rfc3339(),
        None => format!("{}ms", ms),
    }
}

/// Print a single stats line.
fn fmt_line(out: &mut String, key: &str, stat: &str, value: f64) {
    let _ = writeln!(out, "    {}: {} {}", key, stat, value);
}

fn fmt_state(out: &mut String, key: &str, state: &AggregateState) {
    match state.kind() {
        Kind::Counter => fmt_line(out, key, "sum", state.sum()),
        Kind::Gauge => fmt_line(out, key, "last", state.last()),
        Kind::Histogram => {
            for bucket in state.buckets() {
                let le = match bucket.le {
                    Some(le) => format!("le={}", le),
                    None => "le=+Inf".to_string(),
                };
                fmt_line(out, key, &le, bucket.count as f64);
            }
            fmt_line(out, key, "sum", state.sum());
            fmt_line(out, key, "count", state.count() as f64);
        }
    }
}

/// Render a snapshot the way `Console` prints it.
pub fn render(snapshot: &Snapshot) -> String {
    let mut out = String::with_capacity(128 + snapshot.series.len() * 64);
    let _ = writeln!(
        out,
        "Flushing window: {} .. {}",
        fmt_ms(snapshot.window.start),
        fmt_ms(snapshot.window.end)
    );
    for &(kind, title) in &[
        (Kind::Counter, "counters"),
        (Kind::Gauge, "gauges"),
        (Kind::Histogram, "histograms"),
    ] {
        let _ = writeln!(out, "  {}:", title);
        for s in snapshot.series.iter().filter(|s| s.state.kind() == kind) {
            fmt_state(&mut out, s.key.as_str(), &s.state);
        }
    }
    out
}

impl Sink for Console {
    fn export(&mut self, snapshot: &Snapshot) -> Result<(), ExportError> {
        let text = render(snapshot);
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
        handle.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
