//! TelemetryHub is a telemetry ingestion and aggregation server. Producers
//! hand it decoded telemetry records; it validates them, absorbs bursts in a
//! bounded buffer, aggregates counters, gauges and histograms into fixed
//! windows keyed by metric name and label set, and ships each closed window
//! to an export sink.
//!
//! The moving parts, leaf-first:
//!
//!  * `validate` rejects malformed records before they cost anything.
//!  * `buffer` is the bounded queue between intake and aggregation. When it
//!    fills, producers are told so immediately.
//!  * `buckets` owns every aggregate and the window bookkeeping.
//!  * `flush` drives time: it swaps closed windows out of `buckets` and
//!    delivers them to a `sink::Sink`, retrying and spilling as configured.
//!  * `pipeline` wires those together on worker threads and shuts them down
//!    in order.
//!
//! Operational counters for all of the above live in an `internal::Registry`
//! handle that is passed to each component.
#![allow(unknown_lints)]
#![deny(unstable_features, unused_import_braces)]
#![warn(trivial_numeric_casts, missing_docs)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
extern crate tempdir;

pub mod buckets;
pub mod buffer;
pub mod config;
pub mod flush;
pub mod http;
pub mod internal;
pub mod metric;
pub mod pipeline;
pub mod sink;
pub mod spill;
pub mod thread;
pub mod time;
pub mod validate;
