//! Re-armable countdown timer backed by one persistent background thread.
//!
//! The thread is spawned once and reused across arbitrarily many arm/disarm
//! cycles: it parks on its command channel while idle and counts down with
//! `recv_timeout` while armed, so re-arming never races a stale firing and
//! never pays a thread-spawn.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::util::join_with_timeout;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TimerError {
    /// The background thread is gone; no further arm/disarm is valid.
    #[error("timer '{0}' has been shut down")]
    Stopped(String),
}

enum TimerCmd {
    Arm(Duration),
    Disarm,
    Shutdown,
}

/// A countdown primitive that can be armed and disarmed arbitrarily many
/// times while reusing one background thread.
///
/// The callback is fixed at construction and invoked at most once per armed
/// cycle, on the timer's own thread.
pub struct ReentrantTimer {
    name: String,
    tx: Sender<TimerCmd>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReentrantTimer {
    /// Spawn the timer thread. The timer starts idle.
    pub fn spawn<F>(name: &str, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("timer-{}", name))
            .spawn(move || Self::run_loop(rx, callback))
            .expect("Failed to spawn timer thread");

        Self {
            name: name.to_string(),
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Timer thread main loop: parked on `recv` while idle, counting down
    /// on `recv_timeout` while armed.
    fn run_loop<F: Fn()>(rx: Receiver<TimerCmd>, callback: F) {
        'idle: loop {
            let interval = match rx.recv() {
                Ok(TimerCmd::Arm(d)) => d,
                // Disarm while idle is a no-op.
                Ok(TimerCmd::Disarm) => continue 'idle,
                Ok(TimerCmd::Shutdown) | Err(_) => return,
            };

            let mut deadline = Instant::now() + interval;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Err(RecvTimeoutError::Timeout) => {
                        callback();
                        continue 'idle;
                    }
                    // Re-arm resets the remaining interval; the pending
                    // firing is superseded, never duplicated.
                    Ok(TimerCmd::Arm(d)) => deadline = Instant::now() + d,
                    Ok(TimerCmd::Disarm) => continue 'idle,
                    Ok(TimerCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }

    /// Schedule the callback to fire after `interval`. Re-arming while
    /// already armed resets the countdown.
    pub fn arm(&self, interval: Duration) -> Result<(), TimerError> {
        self.tx
            .send(TimerCmd::Arm(interval))
            .map_err(|_| TimerError::Stopped(self.name.clone()))
    }

    /// Cancel a pending firing. No-op while idle.
    pub fn disarm(&self) -> Result<(), TimerError> {
        self.tx
            .send(TimerCmd::Disarm)
            .map_err(|_| TimerError::Stopped(self.name.clone()))
    }

    /// Permanently stop the background thread. Idempotent; after this no
    /// firing will ever occur and arm/disarm return [`TimerError::Stopped`].
    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCmd::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, SHUTDOWN_GRACE, &self.name);
            debug!(timer = %self.name, "timer thread stopped");
        }
    }
}

impl Drop for ReentrantTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
