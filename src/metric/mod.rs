//! The telemetry data model.
//!
//! A `RawRecord` is what producers hand to the intake: already decoded, not
//! yet trusted. `validate::Validator` turns it into a `TelemetryRecord`,
//! which is immutable from then on and is what the rest of the pipeline
//! moves around.

use std::collections::BTreeMap;
use std::fmt;

mod tagmap;

pub use self::tagmap::TagMap;

/// The aggregation kind of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Monotonic deltas, summed per window.
    Counter,
    /// Point-in-time values, last write wins per window.
    Gauge,
    /// Samples distributed over configured bucket bounds.
    Histogram,
}

impl Kind {
    /// Parse a kind name. Matching is case-insensitive; unknown names are
    /// `None`.
    pub fn parse(name: &str) -> Option<Kind> {
        match name.to_ascii_lowercase().as_str() {
            "counter" => Some(Kind::Counter),
            "gauge" => Some(Kind::Gauge),
            "histogram" => Some(Kind::Histogram),
            _ => None,
        }
    }

    /// The canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unvalidated telemetry record as it arrives at the intake.
///
/// `kind` is a free-form string here so that unknown kinds can be rejected
/// and counted rather than failing deserialization of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Metric name, e.g. `http_requests_total`.
    pub metric_name: String,
    /// `counter`, `gauge` or `histogram`.
    pub kind: String,
    /// The sample.
    pub value: f64,
    /// Label set. Order is irrelevant.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl RawRecord {
    /// Make a raw record of the given kind, stamped with the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetryhub::metric::RawRecord;
    ///
    /// let raw = RawRecord::new("requests", "counter", 1.0)
    ///     .label("code", "200")
    ///     .timestamp(1_000);
    ///
    /// assert_eq!(raw.kind, "counter");
    /// assert_eq!(raw.timestamp, 1_000);
    /// assert_eq!(raw.labels.get("code").map(|s| s.as_str()), Some("200"));
    /// ```
    pub fn new<S, K>(name: S, kind: K, value: f64) -> RawRecord
    where
        S: Into<String>,
        K: Into<String>,
    {
        RawRecord {
            metric_name: name.into(),
            kind: kind.into(),
            value,
            labels: BTreeMap::new(),
            timestamp: crate::time::now_ms(),
        }
    }

    /// A counter delta.
    pub fn counter<S: Into<String>>(name: S, value: f64) -> RawRecord {
        RawRecord::new(name, "counter", value)
    }

    /// A gauge reading.
    pub fn gauge<S: Into<String>>(name: S, value: f64) -> RawRecord {
        RawRecord::new(name, "gauge", value)
    }

    /// A histogram sample.
    pub fn histogram<S: Into<String>>(name: S, value: f64) -> RawRecord {
        RawRecord::new(name, "histogram", value)
    }

    /// Set the timestamp, epoch milliseconds.
    pub fn timestamp(mut self, ts: i64) -> RawRecord {
        self.timestamp = ts;
        self
    }

    /// Overlay a label. An existing value under `key` is replaced.
    pub fn label<K, V>(mut self, key: K, val: V) -> RawRecord
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.labels.insert(key.into(), val.into());
        self
    }
}

/// A validated telemetry record.
///
/// There are no setters: once the validator has accepted a record it stays
/// exactly as accepted until aggregation consumes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    name: String,
    kind: Kind,
    value: f64,
    labels: TagMap,
    timestamp: i64,
}

impl TelemetryRecord {
    pub(crate) fn new(
        name: String,
        kind: Kind,
        value: f64,
        labels: TagMap,
        timestamp: i64,
    ) -> TelemetryRecord {
        TelemetryRecord {
            name,
            kind,
            value,
            labels,
            timestamp,
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The aggregation kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The sample value. Always finite.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The label set.
    pub fn labels(&self) -> &TagMap {
        &self.labels
    }

    /// Epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The identity of the series this record belongs to.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.name, &self.labels)
    }

    pub(crate) fn into_name_labels(self) -> (String, TagMap) {
        (self.name, self.labels)
    }
}

/// Deterministic identity of a metric name plus label set.
///
/// The key is the Prometheus-style rendering `name{k1="v1",k2="v2"}` with
/// labels in key order, so the same label set always yields the same key no
/// matter how it was assembled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SeriesKey(String);

impl SeriesKey {
    /// Derive the key for `name` and `labels`.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetryhub::metric::{SeriesKey, TagMap};
    ///
    /// let a: TagMap = vec![("zone", "eu"), ("app", "api")].into_iter().collect();
    /// let b: TagMap = vec![("app", "api"), ("zone", "eu")].into_iter().collect();
    ///
    /// assert_eq!(SeriesKey::new("up", &a), SeriesKey::new("up", &b));
    /// assert_eq!(SeriesKey::new("up", &a).as_str(), r#"up{app="api",zone="eu"}"#);
    /// ```
    pub fn new(name: &str, labels: &TagMap) -> SeriesKey {
        let mut s = String::with_capacity(name.len() + labels.len() * 16);
        s.push_str(name);
        if !labels.is_empty() {
            s.push('{');
            for (i, &(ref k, ref v)) in labels.iter().enumerate() {
                if i > 0 {
                    s.push(',');
                }
                s.push_str(k);
                s.push_str("=\"");
                escape_into(v, &mut s);
                s.push('"');
            }
            s.push('}');
        }
        SeriesKey(s)
    }

    /// The rendered key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escape a label value the way the Prometheus text format does, so that no
/// value can forge a label boundary inside a key.
pub(crate) fn escape_into(value: &str, s: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => s.push_str("\\\\"),
            '"' => s.push_str("\\\""),
            '\n' => s.push_str("\\n"),
            c => s.push(c),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    #[test]
    fn kind_parse_is_case_insensitive() {
        assert_eq!(Some(Kind::Counter), Kind::parse("COUNTER"));
        assert_eq!(Some(Kind::Gauge), Kind::parse("Gauge"));
        assert_eq!(Some(Kind::Histogram), Kind::parse("histogram"));
        assert_eq!(None, Kind::parse("summary"));
        assert_eq!(None, Kind::parse(""));
    }

    #[test]
    fn series_key_without_labels_is_bare_name() {
        assert_eq!("up", SeriesKey::new("up", &TagMap::default()).as_str());
    }

    #[test]
    fn series_key_escapes_values() {
        let labels: TagMap = vec![("path", "a\"b,c=\"d")].into_iter().collect();
        let key = SeriesKey::new("req", &labels);
        assert_eq!(r#"req{path="a\"b,c=\"d"}"#, key.as_str());

        let forged: TagMap = vec![("path", "a"), ("c", "d")].into_iter().collect();
        assert_ne!(key, SeriesKey::new("req", &forged));
    }

    #[test]
    fn series_key_permutation_invariant() {
        fn inner(name: u8, pairs: Vec<(u8, u8)>, rotate: usize) -> TestResult {
            let mut uniq: Vec<(String, String)> = Vec::new();
            for (k, v) in pairs {
                let k = format!("l{}", k);
                if !uniq.iter().any(|&(ref uk, _)| *uk == k) {
                    uniq.push((k, format!("{}", v)));
                }
            }
            let name = format!("m{}", name);
            let in_order: TagMap = uniq.clone().into_iter().collect();
            let mut shuffled = uniq.clone();
            if !shuffled.is_empty() {
                let n = rotate % shuffled.len();
                shuffled.rotate_left(n);
            }
            shuffled.reverse();
            let permuted: TagMap = shuffled.into_iter().collect();
            assert_eq!(
                SeriesKey::new(&name, &in_order),
                SeriesKey::new(&name, &permuted)
            );
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .max_tests(10000)
            .quickcheck(inner as fn(u8, Vec<(u8, u8)>, usize) -> TestResult);
    }
}
