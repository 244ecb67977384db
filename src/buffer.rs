//! The ingestion buffer.
//!
//! A bounded FIFO between the intake and the aggregation engine. Producers
//! call `enqueue` from any thread; a single consumer drains with
//! `dequeue_batch`. Nothing here ever blocks waiting for room: a full buffer
//! answers `EnqueueError::BufferFull` straight away and it is the caller's
//! job to back off. That answer is the backpressure signal of the whole
//! pipeline.

use crate::internal::Registry;
use crate::metric::TelemetryRecord;
use std::collections::VecDeque;
use std::error;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

/// Why a record could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The buffer is at capacity. Retry later.
    BufferFull,
    /// The buffer has been closed for shutdown and takes nothing more.
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            EnqueueError::BufferFull => write!(f, "ingestion buffer is full"),
            EnqueueError::Closed => write!(f, "ingestion buffer is closed"),
        }
    }
}

impl error::Error for EnqueueError {}

#[derive(Debug)]
struct Queue {
    records: VecDeque<TelemetryRecord>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer record queue.
///
/// The closed flag lives under the same lock as the records. An `enqueue`
/// either lands before `close` or is refused, so once `is_drained` answers
/// true no accepted record can still arrive.
#[derive(Debug)]
pub struct Buffer {
    queue: Mutex<Queue>,
    capacity: usize,
    registry: Arc<Registry>,
}

impl Buffer {
    /// Create a buffer holding at most `capacity` records. A capacity of
    /// zero is bumped to one.
    pub fn new(capacity: usize, registry: Arc<Registry>) -> Buffer {
        let capacity = capacity.max(1);
        registry.buffer_capacity.store(capacity, Ordering::Relaxed);
        registry.buffer_occupancy.store(0, Ordering::Relaxed);
        Buffer {
            queue: Mutex::new(Queue {
                records: VecDeque::with_capacity(capacity.min(65_536)),
                closed: false,
            }),
            capacity,
            registry,
        }
    }

    // A producer that panicked while holding the lock cannot have left the
    // deque half-mutated, VecDeque operations being what they are, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<Queue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a record to the back of the queue, or fail immediately.
    pub fn enqueue(&self, record: TelemetryRecord) -> Result<(), EnqueueError> {
        let mut q = self.lock();
        if q.closed {
            drop(q);
            self.registry.buffer_closed.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::Closed);
        }
        if q.records.len() >= self.capacity {
            drop(q);
            self.registry.buffer_full.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::BufferFull);
        }
        q.records.push_back(record);
        self.registry
            .buffer_occupancy
            .store(q.records.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Remove up to `max_n` records from the front of the queue. Returns
    /// whatever is available, possibly nothing.
    pub fn dequeue_batch(&self, max_n: usize) -> Vec<TelemetryRecord> {
        let mut q = self.lock();
        let n = max_n.min(q.records.len());
        let batch: Vec<TelemetryRecord> = q.records.drain(..n).collect();
        self.registry
            .buffer_occupancy
            .store(q.records.len(), Ordering::Relaxed);
        batch
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting records. Records already queued stay put for the
    /// consumer to drain.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the buffer is closed and empty. Nothing will ever be
    /// dequeued again.
    pub fn is_drained(&self) -> bool {
        let q = self.lock();
        q.closed && q.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::{Kind, TagMap};
    use std::thread;
    use std::time::{Duration, Instant};

    fn record(name: &str, value: f64) -> TelemetryRecord {
        TelemetryRecord::new(name.into(), Kind::Counter, value, TagMap::default(), 0)
    }

    #[test]
    fn full_buffer_fails_fast() {
        let registry = Registry::new();
        let buf = Buffer::new(2, Arc::clone(&registry));
        assert!(buf.enqueue(record("a", 1.0)).is_ok());
        assert!(buf.enqueue(record("a", 2.0)).is_ok());

        let start = Instant::now();
        for _ in 0..100 {
            assert_eq!(Err(EnqueueError::BufferFull), buf.enqueue(record("a", 3.0)));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(2, buf.len());
        assert_eq!(100, registry.buffer_full.load(Ordering::Relaxed));
        assert_eq!(2, registry.buffer_occupancy.load(Ordering::Relaxed));

        buf.dequeue_batch(1);
        assert!(buf.enqueue(record("a", 4.0)).is_ok());
    }

    #[test]
    fn dequeue_batch_is_fifo_and_bounded() {
        let buf = Buffer::new(10, Registry::new());
        assert!(buf.dequeue_batch(5).is_empty());
        for i in 0..7 {
            buf.enqueue(record("a", i as f64)).unwrap();
        }
        let first: Vec<f64> = buf.dequeue_batch(4).iter().map(|r| r.value()).collect();
        assert_eq!(vec![0.0, 1.0, 2.0, 3.0], first);
        let rest: Vec<f64> = buf.dequeue_batch(100).iter().map(|r| r.value()).collect();
        assert_eq!(vec![4.0, 5.0, 6.0], rest);
        assert!(buf.is_empty());
    }

    #[test]
    fn closed_buffer_rejects_but_drains() {
        let registry = Registry::new();
        let buf = Buffer::new(4, Arc::clone(&registry));
        buf.enqueue(record("a", 1.0)).unwrap();
        buf.close();
        assert!(buf.is_closed());
        assert_eq!(Err(EnqueueError::Closed), buf.enqueue(record("a", 2.0)));
        assert!(!buf.is_drained());
        assert_eq!(1, buf.dequeue_batch(10).len());
        assert!(buf.is_drained());
        assert_eq!(1, registry.buffer_closed.load(Ordering::Relaxed));
    }

    #[test]
    fn close_racing_producers_loses_nothing_accepted() {
        for _ in 0..50 {
            let buf = Arc::new(Buffer::new(1_000_000, Registry::new()));
            let consumer = {
                let buf = Arc::clone(&buf);
                thread::spawn(move || {
                    let mut seen = 0;
                    loop {
                        let batch = buf.dequeue_batch(64);
                        if batch.is_empty() {
                            if buf.is_drained() {
                                return seen;
                            }
                            thread::yield_now();
                        }
                        seen += batch.len();
                    }
                })
            };
            let mut producers = Vec::new();
            for _ in 0..8 {
                let buf = Arc::clone(&buf);
                producers.push(thread::spawn(move || {
                    let mut accepted = 0;
                    while buf.enqueue(record("a", 1.0)).is_ok() {
                        accepted += 1;
                    }
                    accepted
                }));
            }
            thread::sleep(Duration::from_millis(1));
            buf.close();
            let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();
            assert_eq!(accepted, consumer.join().unwrap());
        }
    }

    #[test]
    fn zero_capacity_bumped() {
        let buf = Buffer::new(0, Registry::new());
        assert_eq!(1, buf.capacity());
    }

    #[test]
    fn concurrent_producers_preserve_per_producer_order() {
        let buf = Arc::new(Buffer::new(10_000, Registry::new()));
        let mut handles = Vec::new();
        for p in 0..4 {
            let buf = Arc::clone(&buf);
            handles.push(thread::spawn(move || {
                for i in 0..1_000 {
                    let name = format!("p{}", p);
                    buf.enqueue(record(&name, i as f64)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let all = buf.dequeue_batch(10_000);
        assert_eq!(4_000, all.len());
        for p in 0..4 {
            let name = format!("p{}", p);
            let seen: Vec<f64> = all
                .iter()
                .filter(|r| r.name() == name)
                .map(|r| r.value())
                .collect();
            let expected: Vec<f64> = (0..1_000).map(|i| i as f64).collect();
            assert_eq!(expected, seen);
        }
    }
}
