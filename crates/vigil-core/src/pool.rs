//! Generic worker pool: N long-lived threads draining one bounded queue.
//!
//! The same shape backs both the execution pool (messages carry job
//! references) and the submission pool (messages carry result envelopes).
//! Shutdown pushes exactly one quit sentinel per worker, then joins each
//! thread with a grace period and detaches stragglers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::util::join_with_timeout;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Tagged queue message: a unit of work or the quit sentinel.
pub enum PoolMessage<T> {
    Job(T),
    Quit,
}

/// How a handler failure affects the worker that hit it.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The message was unusable; log it, skip it, keep the worker alive.
    #[error("discarded: {0}")]
    Discard(String),

    /// Unrecoverable worker state; this worker's loop ends. The pool is not
    /// replenished.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type PoolHandler<T> = Arc<dyn Fn(T) -> Result<(), PoolError> + Send + Sync>;

/// Fixed set of named workers over one bounded multi-producer queue.
pub struct Pool<T> {
    name: String,
    size: usize,
    tx: Sender<PoolMessage<T>>,
    rx: Receiver<PoolMessage<T>>,
    handler: PoolHandler<T>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl<T> Pool<T> {
    pub fn new(name: &str, size: usize, queue_size: usize, handler: PoolHandler<T>) -> Self {
        let (tx, rx) = channel::bounded(queue_size);
        Self {
            name: name.to_string(),
            size,
            tx,
            rx,
            handler,
            handles: Vec::new(),
            started: false,
        }
    }

    /// Producer handle into the pool's queue. Sends block while the queue
    /// is full.
    pub fn sender(&self) -> Sender<PoolMessage<T>> {
        self.tx.clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Push one quit sentinel per worker, then join each with a grace
    /// period. Messages queued ahead of the sentinels are still drained.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!(pool = %self.name, "stopping pool");
        for _ in 0..self.handles.len() {
            if self.tx.send(PoolMessage::Quit).is_err() {
                break;
            }
        }
        for handle in self.handles.drain(..) {
            join_with_timeout(handle, STOP_GRACE, &self.name);
        }
        self.started = false;
        info!(pool = %self.name, "pool stopped");
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Launch all workers. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        for i in 0..self.size {
            let worker_name = format!("{}-{}", self.name, i);
            let rx = self.rx.clone();
            let handler = self.handler.clone();
            let handle = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || Self::worker_loop(&worker_name, rx, handler))
                .expect("Failed to spawn pool worker thread");
            self.handles.push(handle);
        }
        self.started = true;
        info!(pool = %self.name, workers = self.size, "pool started");
    }

    fn worker_loop(name: &str, rx: Receiver<PoolMessage<T>>, handler: PoolHandler<T>) {
        debug!(worker = %name, "worker running");
        loop {
            match rx.recv() {
                Ok(PoolMessage::Job(job)) => match handler(job) {
                    Ok(()) => {}
                    Err(PoolError::Discard(reason)) => {
                        warn!(worker = %name, %reason, "message discarded");
                    }
                    Err(PoolError::Fatal(reason)) => {
                        error!(worker = %name, %reason, "worker stopping on fatal error");
                        break;
                    }
                },
                Ok(PoolMessage::Quit) => {
                    debug!(worker = %name, "quit received");
                    break;
                }
                Err(_) => break,
            }
        }
        debug!(worker = %name, "worker stopped");
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
