//! Record validation.
//!
//! The validator is the first thing a `RawRecord` meets. It normalizes the
//! record and either hands back an immutable `TelemetryRecord` or says why
//! not. Rejections are counted in the registry by reason; the validator has
//! no other side effect.

use crate::internal::{RejectReason, Registry};
use crate::metric::{Kind, RawRecord, TagMap, TelemetryRecord};
use crate::time;
use regex::Regex;
use std::error;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    static ref METRIC_NAME: Regex =
        Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name pattern");
    static ref LABEL_NAME: Regex =
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern");
}

/// Why a record failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The metric name was empty after trimming.
    EmptyName,
    /// The metric name contains characters outside `[a-zA-Z0-9_:]` or
    /// starts with a digit.
    InvalidName(String),
    /// The kind is not one of counter, gauge, histogram.
    UnknownKind(String),
    /// The value is NaN or infinite.
    NonFinite(f64),
    /// A label name is not a valid identifier.
    InvalidLabelName(String),
    /// The timestamp is further from the current time than the configured
    /// tolerance allows, in either direction.
    ClockSkew {
        /// The record's timestamp, epoch milliseconds.
        timestamp: i64,
        /// The validator's notion of now, epoch milliseconds.
        now: i64,
        /// The configured tolerance, milliseconds.
        tolerance: i64,
    },
}

impl ValidationError {
    /// The reason this error is counted under.
    pub fn reason(&self) -> RejectReason {
        match *self {
            ValidationError::EmptyName => RejectReason::EmptyName,
            ValidationError::InvalidName(_) => RejectReason::InvalidName,
            ValidationError::UnknownKind(_) => RejectReason::UnknownKind,
            ValidationError::NonFinite(_) => RejectReason::NonFinite,
            ValidationError::InvalidLabelName(_) => RejectReason::InvalidLabel,
            ValidationError::ClockSkew { .. } => RejectReason::ClockSkew,
        }
    }

    /// True for the clock skew family of rejections.
    pub fn is_clock_skew(&self) -> bool {
        match *self {
            ValidationError::ClockSkew { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ValidationError::EmptyName => write!(f, "metric name is empty"),
            ValidationError::InvalidName(ref n) => write!(f, "invalid metric name {:?}", n),
            ValidationError::UnknownKind(ref k) => write!(f, "unknown metric kind {:?}", k),
            ValidationError::NonFinite(v) => write!(f, "value {} is not finite", v),
            ValidationError::InvalidLabelName(ref l) => write!(f, "invalid label name {:?}", l),
            ValidationError::ClockSkew {
                timestamp,
                now,
                tolerance,
            } => write!(
                f,
                "timestamp {} is more than {}ms away from now ({})",
                timestamp, tolerance, now
            ),
        }
    }
}

impl error::Error for ValidationError {}

/// Validates raw records against the naming, kind, value and clock rules.
#[derive(Debug, Clone)]
pub struct Validator {
    clock_skew_tolerance: i64,
    registry: Arc<Registry>,
}

impl Validator {
    /// Create a validator that accepts timestamps within
    /// `clock_skew_tolerance` of the wall clock.
    pub fn new(clock_skew_tolerance: Duration, registry: Arc<Registry>) -> Validator {
        Validator {
            clock_skew_tolerance: time::duration_ms(clock_skew_tolerance),
            registry,
        }
    }

    /// Validate against the current wall clock.
    pub fn validate(&self, raw: RawRecord) -> Result<TelemetryRecord, ValidationError> {
        self.validate_at(raw, time::now_ms())
    }

    /// Validate with an explicit notion of "now", epoch milliseconds.
    pub fn validate_at(
        &self,
        raw: RawRecord,
        now: i64,
    ) -> Result<TelemetryRecord, ValidationError> {
        match check(raw, now, self.clock_skew_tolerance) {
            Ok(record) => {
                self.registry
                    .records_validated
                    .fetch_add(1, Ordering::Relaxed);
                Ok(record)
            }
            Err(e) => {
                self.registry.reject(e.reason());
                debug!("rejected record: {}", e);
                Err(e)
            }
        }
    }
}

fn check(raw: RawRecord, now: i64, tolerance: i64) -> Result<TelemetryRecord, ValidationError> {
    let name = raw.metric_name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if !METRIC_NAME.is_match(name) {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    let kind = match Kind::parse(raw.kind.trim()) {
        Some(kind) => kind,
        None => return Err(ValidationError::UnknownKind(raw.kind)),
    };
    if !raw.value.is_finite() {
        return Err(ValidationError::NonFinite(raw.value));
    }
    let mut labels = TagMap::default();
    for (k, v) in raw.labels {
        if !LABEL_NAME.is_match(&k) {
            return Err(ValidationError::InvalidLabelName(k));
        }
        labels.insert(k, v);
    }
    let skew = raw
        .timestamp
        .saturating_sub(now)
        .checked_abs()
        .unwrap_or_else(i64::max_value);
    if skew > tolerance {
        return Err(ValidationError::ClockSkew {
            timestamp: raw.timestamp,
            now,
            tolerance,
        });
    }
    // -0.0 and 0.0 aggregate identically but print differently.
    let value = if raw.value == 0.0 { 0.0 } else { raw.value };
    Ok(TelemetryRecord::new(
        name.to_string(),
        kind,
        value,
        labels,
        raw.timestamp,
    ))
}
