//! Wiring.
//!
//! `Pipeline::start` builds every component from `Args`, spawns the consumer
//! and scheduler threads and, if configured, the HTTP surface. Producers get
//! an `Intake`, a cheap clonable handle that validates and enqueues.
//! `Pipeline::shutdown` tears down in dependency order so that nothing
//! accepted is dropped without being counted.

use crate::buckets::{self, BoundsError, Buckets, Engine};
use crate::buffer::{Buffer, EnqueueError};
use crate::config::Args;
use crate::flush::{DurabilityPolicy, FlushScheduler, StateCell};
use crate::http;
use crate::internal::Registry;
use crate::metric::RawRecord;
use crate::sink::Sink;
use crate::spill::Spill;
use crate::thread::{self, Stop, Stoppable, ThreadHandle};
use crate::time;
use crate::validate::{ValidationError, Validator};
use std::error;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

/// Why a record was not accepted at the intake.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeError {
    /// The record is malformed.
    Invalid(ValidationError),
    /// The buffer refused it.
    Buffer(EnqueueError),
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            IntakeError::Invalid(ref e) => write!(f, "invalid record: {}", e),
            IntakeError::Buffer(ref e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for IntakeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            IntakeError::Invalid(ref e) => Some(e),
            IntakeError::Buffer(ref e) => Some(e),
        }
    }
}

impl From<ValidationError> for IntakeError {
    fn from(e: ValidationError) -> IntakeError {
        IntakeError::Invalid(e)
    }
}

impl From<EnqueueError> for IntakeError {
    fn from(e: EnqueueError) -> IntakeError {
        IntakeError::Buffer(e)
    }
}

/// The result of `Intake::submit_batch`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records enqueued.
    pub accepted: usize,
    /// Records that failed validation.
    pub rejected: usize,
    /// The first validation failure, if any.
    pub first_error: Option<ValidationError>,
    /// Set if the buffer refused a record. Submission stops there.
    pub backpressure: Option<EnqueueError>,
    /// Records not looked at because of backpressure.
    pub unprocessed: usize,
}

/// A point-in-time view of the pipeline for health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    /// Configured application name.
    pub app: String,
    /// False once shutdown has begun.
    pub accepting: bool,
    /// Records waiting in the buffer.
    pub buffer_occupancy: usize,
    /// Buffer capacity.
    pub buffer_capacity: usize,
    /// Epoch milliseconds of the last successful export.
    pub last_flush_ms: Option<i64>,
    /// The flush scheduler's state.
    pub flush_state: &'static str,
}

impl Health {
    /// Ready means the intake would take a record right now.
    pub fn is_ready(&self) -> bool {
        self.accepting && self.buffer_occupancy < self.buffer_capacity
    }
}

/// Producer handle: validate, then enqueue.
#[derive(Debug, Clone)]
pub struct Intake {
    validator: Validator,
    buffer: Arc<Buffer>,
    registry: Arc<Registry>,
    state: StateCell,
    app_name: Arc<String>,
}

impl Intake {
    /// Validate and enqueue one record.
    pub fn submit(&self, raw: RawRecord) -> Result<(), IntakeError> {
        let record = self.validator.validate(raw)?;
        self.buffer.enqueue(record)?;
        Ok(())
    }

    /// Validate and enqueue records in order. Invalid records are skipped and
    /// counted; the first buffer refusal stops the batch.
    pub fn submit_batch(&self, raws: Vec<RawRecord>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let total = raws.len();
        for (idx, raw) in raws.into_iter().enumerate() {
            match self.submit(raw) {
                Ok(()) => outcome.accepted += 1,
                Err(IntakeError::Invalid(e)) => {
                    outcome.rejected += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(e);
                    }
                }
                Err(IntakeError::Buffer(e)) => {
                    outcome.backpressure = Some(e);
                    outcome.unprocessed = total - idx;
                    break;
                }
            }
        }
        outcome
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Read the pipeline's current health. No side effects.
    pub fn health(&self) -> Health {
        Health {
            app: self.app_name.as_ref().clone(),
            accepting: !self.buffer.is_closed(),
            buffer_occupancy: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            last_flush_ms: self.registry.last_flush(),
            flush_state: self.state.get().as_str(),
        }
    }
}

/// Why the pipeline could not start.
#[derive(Debug)]
pub enum StartError {
    /// Histogram configuration is unusable.
    Bounds(BoundsError),
    /// The spill directory could not be prepared.
    Spill(io::Error),
    /// The HTTP surface could not bind.
    Http(io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StartError::Bounds(ref e) => write!(f, "histogram configuration: {}", e),
            StartError::Spill(ref e) => write!(f, "spill directory: {}", e),
            StartError::Http(ref e) => write!(f, "http server: {}", e),
        }
    }
}

impl error::Error for StartError {}

impl From<BoundsError> for StartError {
    fn from(e: BoundsError) -> StartError {
        StartError::Bounds(e)
    }
}

fn consume(buffer: &Buffer, engine: &Engine, batch_size: usize, stop: &Stop) {
    let mut attempts: u32 = 0;
    loop {
        let batch = buffer.dequeue_batch(batch_size);
        if batch.is_empty() {
            if buffer.is_drained() || stop.is_raised() {
                break;
            }
            attempts = attempts.saturating_add(1);
            time::delay(attempts);
            continue;
        }
        attempts = 0;
        let mut engine = buckets::lock(engine);
        for record in batch {
            engine.apply(record);
        }
    }
    trace!("consumer drained, exiting");
}

/// The running pipeline.
pub struct Pipeline {
    intake: Intake,
    buffer: Arc<Buffer>,
    engine: Engine,
    registry: Arc<Registry>,
    consumer: Option<ThreadHandle>,
    scheduler: Option<ThreadHandle>,
    http: Option<http::Server>,
}

impl Pipeline {
    /// Build and start every component.
    pub fn start(args: &Args, sink: Box<dyn Sink>) -> Result<Pipeline, StartError> {
        let registry = Registry::new();
        let bounds = args.histogram()?;
        let spill = match args.durability_policy {
            DurabilityPolicy::Spill => {
                Some(Spill::new(&args.data_directory).map_err(StartError::Spill)?)
            }
            DurabilityPolicy::Drop => None,
        };

        let buffer = Arc::new(Buffer::new(args.buffer_capacity, Arc::clone(&registry)));
        let engine: Engine = Arc::new(Mutex::new(Buckets::new(
            args.window_size,
            args.late_arrival_tolerance,
            bounds,
            Arc::clone(&registry),
        )));
        let scheduler = FlushScheduler::new(
            Arc::clone(&engine),
            sink,
            spill,
            args.flush_config(),
            Arc::clone(&registry),
        );
        let intake = Intake {
            validator: Validator::new(args.clock_skew_tolerance, Arc::clone(&registry)),
            buffer: Arc::clone(&buffer),
            registry: Arc::clone(&registry),
            state: scheduler.state(),
            app_name: Arc::new(args.app_name.clone()),
        };

        let http = match args.http {
            Some(ref cfg) => Some(
                http::Server::new(&cfg.host_port(), intake.clone()).map_err(StartError::Http)?,
            ),
            None => None,
        };

        let consumer = {
            let buffer = Arc::clone(&buffer);
            let engine = Arc::clone(&engine);
            let batch_size = args.batch_size;
            thread::spawn("consumer", move |stop| {
                consume(&buffer, &engine, batch_size, &stop)
            })
        };
        let scheduler = thread::spawn("flush", move |stop| scheduler.run(stop));

        info!(
            "{} started: window {:?}, buffer {}, policy {:?}",
            args.app_name, args.window_size, args.buffer_capacity, args.durability_policy
        );
        Ok(Pipeline {
            intake,
            buffer,
            engine,
            registry,
            consumer: Some(consumer),
            scheduler: Some(scheduler),
            http,
        })
    }

    /// A new producer handle.
    pub fn intake(&self) -> Intake {
        self.intake.clone()
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Current health.
    pub fn health(&self) -> Health {
        self.intake.health()
    }

    /// Where the HTTP surface is listening, if it is.
    pub fn http_addr(&self) -> Option<::std::net::SocketAddr> {
        self.http.as_ref().map(|s| s.local_addr())
    }

    /// Series in open windows.
    pub fn series_count(&self) -> usize {
        buckets::lock(&self.engine).series_count()
    }

    /// Stop intake, drain the buffer into the engine, run the final flush,
    /// then stop the HTTP surface.
    pub fn shutdown(mut self) {
        info!("shutting down");
        self.buffer.close();
        if let Some(consumer) = self.consumer.take() {
            consumer.join();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(http) = self.http.take() {
            http.shutdown();
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::{Null, NullConfig};
    use std::time::Duration;

    fn args() -> Args {
        Args {
            http: None,
            buffer_capacity: 4,
            ..Default::default()
        }
    }

    #[test]
    fn batch_counts_rejections_and_backpressure() {
        let pipeline = Pipeline::start(
            &Args {
                batch_size: 1,
                ..args()
            },
            Box::new(Null::new(&NullConfig::new("null".into()))),
        )
        .unwrap();
        let intake = pipeline.intake();
        pipeline.buffer.close();
        assert_eq!(
            Err(IntakeError::Buffer(EnqueueError::Closed)),
            intake.submit(RawRecord::counter("c", 1.0))
        );
        assert_eq!(
            Err(IntakeError::Invalid(ValidationError::EmptyName)),
            intake.submit(RawRecord::counter("", 1.0))
        );

        let outcome = intake.submit_batch(vec![
            RawRecord::counter("bad name", 1.0),
            RawRecord::counter("c", 1.0),
            RawRecord::counter("c", 2.0),
        ]);
        assert_eq!(0, outcome.accepted);
        assert_eq!(1, outcome.rejected);
        assert!(outcome.first_error.is_some());
        assert_eq!(Some(EnqueueError::Closed), outcome.backpressure);
        assert_eq!(2, outcome.unprocessed);
        pipeline.shutdown();
    }

    #[test]
    fn health_reflects_shutdown() {
        let pipeline = Pipeline::start(
            &args(),
            Box::new(Null::new(&NullConfig::new("null".into()))),
        )
        .unwrap();
        let intake = pipeline.intake();
        let health = pipeline.health();
        assert_eq!("TelemetryHub", health.app);
        assert!(health.accepting);
        assert!(health.is_ready());
        assert_eq!(4, health.buffer_capacity);
        assert_eq!(None, health.last_flush_ms);

        intake.submit(RawRecord::gauge("g", 1.0)).unwrap();
        let start = std::time::Instant::now();
        while pipeline.series_count() == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(1, pipeline.series_count());

        pipeline.shutdown();
        let health = intake.health();
        assert!(!health.accepting);
        assert!(!health.is_ready());
        assert!(health.last_flush_ms.is_some());
        assert_eq!(1, intake.registry().flush_success.load(std::sync::atomic::Ordering::Relaxed));
    }
}
