//! A 'sink' is the final destination of a flushed window.
//!
//! The flush scheduler owns exactly one sink and calls `export` once per
//! attempt for each closed window. A sink reports failure by returning an
//! `ExportError`; the scheduler decides whether to retry, spill or give up.
//! Sinks never see the aggregation engine, only owned snapshots.

use crate::buckets::Snapshot;
use std::error;
use std::fmt;
use std::io;

mod console;
mod null;

pub use self::console::{Console, ConsoleConfig};
pub use self::null::{Null, NullConfig};

/// Why an export attempt failed.
#[derive(Debug)]
pub enum ExportError {
    /// The sink hit an I/O error.
    Io(io::Error),
    /// The destination could not be reached. Worth retrying.
    Unavailable(String),
    /// The destination refused the snapshot.
    Rejected(String),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ExportError::Io(ref e) => write!(f, "i/o error: {}", e),
            ExportError::Unavailable(ref s) => write!(f, "sink unavailable: {}", s),
            ExportError::Rejected(ref s) => write!(f, "snapshot rejected: {}", s),
        }
    }
}

impl error::Error for ExportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ExportError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ExportError {
    fn from(e: io::Error) -> ExportError {
        ExportError::Io(e)
    }
}

/// Destination for window snapshots.
pub trait Sink: Send {
    /// Deliver one snapshot. May block; the scheduler bounds how many times
    /// it will ask.
    fn export(&mut self, snapshot: &Snapshot) -> Result<(), ExportError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn export(&mut self, snapshot: &Snapshot) -> Result<(), ExportError> {
        (**self).export(snapshot)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
