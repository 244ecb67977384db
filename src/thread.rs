//! Stoppable worker threads.
//!
//! A worker closure receives a `Stop` token and is expected to poll it at
//! least as often as it is willing to delay shutdown. `ThreadHandle::shutdown`
//! raises the token and joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared shutdown signal.
#[derive(Debug, Clone, Default)]
pub struct Stop {
    flag: Arc<AtomicBool>,
}

impl Stop {
    /// A fresh, lowered signal.
    pub fn new() -> Stop {
        Stop::default()
    }

    /// True once shutdown has been requested.
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Request shutdown.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct ThreadHandle {
    /// JoinHandle for the executing thread.
    pub handle: thread::JoinHandle<()>,
    stop: Stop,
}

impl ThreadHandle {
    /// Join the given Thread, blocking until it exits.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("worker thread panicked");
        }
    }

    /// Gracefully shutdown the given Thread, blocking until it exits.
    ///
    /// Note - It is the responsibility of the worker to poll its `Stop`.
    pub fn shutdown(self) {
        self.stop.raise();
        self.join();
    }
}

/// Spawns a new named thread executing the provided closure.
pub fn spawn<F>(name: &str, f: F) -> ThreadHandle
where
    F: Send + 'static + FnOnce(Stop),
{
    let stop = Stop::new();
    let worker_stop = stop.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || f(worker_stop))
        .unwrap_or_else(|e| panic!("could not spawn {} thread: {}", name, e));
    ThreadHandle { handle, stop }
}

/// Things that own a worker and can be told to wind it down.
pub trait Stoppable {
    /// Join the underlying thread without signalling it.
    fn join(self);

    /// Signal the underlying thread and wait for it to exit.
    fn shutdown(self);
}

impl Stoppable for ThreadHandle {
    fn join(self) {
        ThreadHandle::join(self)
    }

    fn shutdown(self) {
        ThreadHandle::shutdown(self)
    }
}
