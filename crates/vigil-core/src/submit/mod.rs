//! Buffered submission: batch envelopes per sink, flush on capacity or on
//! idle timeout, with at most one send in flight per submitter.

mod file;
mod http;
mod print;

pub use file::FileSink;
pub use http::HttpSink;
pub use print::PrintSink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::envelope::ResultEnvelope;
use crate::timer::ReentrantTimer;
use crate::util::wall_clock;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The destination answered but refused the batch.
    #[error("report server rejected batch: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

/// Pluggable destination for batched envelopes.
///
/// One call drains the whole batch and reports success or failure; any
/// destination-specific retry or backoff belongs inside the implementation.
pub trait Sink: Send {
    fn name(&self) -> &str;

    fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError>;
}

struct BufferState {
    sink: Box<dyn Sink>,
    buf: Vec<ResultEnvelope>,
}

/// Accumulates envelopes for one sink and flushes them on two triggers:
/// reaching `capacity`, or `timeout` elapsing since the last submit.
///
/// The buffer lives behind the submitter's own mutex and is never touched
/// outside it. Sends are single-flight: a flush that finds another send in
/// progress declines instead of queueing behind it. A successful send
/// clears the buffer; a failed one retains it verbatim, so delivery is
/// at-least-once with unbounded retry.
pub struct BufferedSubmitter {
    name: String,
    capacity: usize,
    timeout: Duration,
    state: Mutex<BufferState>,
    sending: AtomicBool,
    timer: ReentrantTimer,
}

impl BufferedSubmitter {
    pub fn new(sink: Box<dyn Sink>, capacity: usize, timeout: Duration) -> Arc<Self> {
        let name = sink.name().to_string();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let timer = ReentrantTimer::spawn(&format!("flush-{}", name), move || {
                if let Some(submitter) = weak.upgrade() {
                    submitter.idle_flush();
                }
            });
            Self {
                name,
                capacity,
                timeout,
                state: Mutex::new(BufferState {
                    sink,
                    buf: Vec::new(),
                }),
                sending: AtomicBool::new(false),
                timer,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffered (not yet delivered) envelope count.
    pub fn pending(&self) -> usize {
        self.state.lock().buf.len()
    }

    /// Append one envelope. Crossing `capacity` triggers a synchronous send
    /// attempt; either way the idle-flush timer restarts from now.
    pub fn submit(&self, mut envelope: ResultEnvelope) {
        let mut state = self.state.lock();
        if envelope.submit_time.is_none() {
            envelope.submit_time = Some(wall_clock());
        }
        state.buf.push(envelope);
        let _ = self.timer.disarm();
        if state.buf.len() >= self.capacity {
            self.flush_locked(&mut state);
        }
        let _ = self.timer.arm(self.timeout);
    }

    /// Idle-timer callback: flush whatever accumulated, if anything.
    fn idle_flush(&self) {
        // Decline before touching the buffer mutex; the caller must never
        // queue behind an in-flight send.
        if self.sending.load(Ordering::Acquire) {
            trace!(submitter = %self.name, "idle flush declined, send in flight");
            return;
        }
        let mut state = self.state.lock();
        if state.buf.is_empty() {
            trace!(submitter = %self.name, "idle flush with no buffered data");
            return;
        }
        self.flush_locked(&mut state);
    }

    /// Single-flight send of the current buffer. Must be called with the
    /// state lock held.
    fn flush_locked(&self, state: &mut BufferState) {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(submitter = %self.name, "send already in flight, declining");
            return;
        }
        let count = state.buf.len();
        if count > 0 {
            match state.sink.drain(&state.buf) {
                Ok(()) => {
                    debug!(submitter = %self.name, count, "batch delivered");
                    state.buf.clear();
                }
                Err(e) => {
                    warn!(
                        submitter = %self.name,
                        count,
                        error = %e,
                        "send failed, batch retained for the next trigger"
                    );
                }
            }
        }
        self.sending.store(false, Ordering::Release);
    }

    /// Stop the idle timer and make a final best-effort flush.
    pub fn close(&self) {
        self.timer.shutdown();
        let mut state = self.state.lock();
        if !state.buf.is_empty() {
            info!(
                submitter = %self.name,
                pending = state.buf.len(),
                "flushing remaining results on close"
            );
            self.flush_locked(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Cmd, Params};
    use crate::expect::Expect;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn envelope(name: &str) -> ResultEnvelope {
        ResultEnvelope {
            cmd: Cmd::Result,
            name: name.to_string(),
            params: Params::new(),
            expect: Expect::String,
            value: Value::String("v".into()),
            errno: 0,
            error: String::new(),
            timestamp: 0,
            submit_time: None,
        }
    }

    /// Records every delivered batch size; fails while `fail` is set.
    struct TestSink {
        batches: Arc<Mutex<Vec<usize>>>,
        fail: Arc<AtomicBool>,
    }

    impl Sink for TestSink {
        fn name(&self) -> &str {
            "test"
        }
        fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Other("injected failure".into()));
            }
            self.batches.lock().push(batch.len());
            Ok(())
        }
    }

    fn submitter_with_sink(
        capacity: usize,
        timeout: Duration,
    ) -> (Arc<BufferedSubmitter>, Arc<Mutex<Vec<usize>>>, Arc<AtomicBool>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let sink = TestSink {
            batches: batches.clone(),
            fail: fail.clone(),
        };
        (
            BufferedSubmitter::new(Box::new(sink), capacity, timeout),
            batches,
            fail,
        )
    }

    #[test]
    fn test_capacity_triggers_exactly_one_send() {
        let (submitter, batches, _) = submitter_with_sink(3, Duration::from_secs(60));
        for i in 0..3 {
            submitter.submit(envelope(&format!("e{}", i)));
        }
        assert_eq!(batches.lock().as_slice(), &[3]);
        assert_eq!(submitter.pending(), 0);
        submitter.close();
    }

    #[test]
    fn test_below_capacity_does_not_send() {
        let (submitter, batches, _) = submitter_with_sink(10, Duration::from_secs(60));
        submitter.submit(envelope("only"));
        assert!(batches.lock().is_empty());
        assert_eq!(submitter.pending(), 1);
        submitter.close();
    }

    #[test]
    fn test_failed_send_retains_buffer_verbatim() {
        let (submitter, batches, fail) = submitter_with_sink(2, Duration::from_secs(60));
        fail.store(true, Ordering::SeqCst);
        submitter.submit(envelope("a"));
        submitter.submit(envelope("b"));
        // Send attempted and failed: nothing delivered, nothing lost.
        assert!(batches.lock().is_empty());
        assert_eq!(submitter.pending(), 2);

        fail.store(false, Ordering::SeqCst);
        submitter.submit(envelope("c"));
        assert_eq!(batches.lock().as_slice(), &[3]);
        assert_eq!(submitter.pending(), 0);
        submitter.close();
    }

    #[test]
    fn test_idle_timeout_flushes_partial_buffer() {
        let (submitter, batches, _) = submitter_with_sink(100, Duration::from_millis(80));
        submitter.submit(envelope("one"));
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(batches.lock().as_slice(), &[1]);
        assert_eq!(submitter.pending(), 0);
        submitter.close();
    }

    #[test]
    fn test_submit_restarts_idle_timer() {
        let (submitter, batches, _) = submitter_with_sink(100, Duration::from_millis(150));
        submitter.submit(envelope("a"));
        std::thread::sleep(Duration::from_millis(80));
        submitter.submit(envelope("b"));
        std::thread::sleep(Duration::from_millis(80));
        // The timer restarted on the second submit; nothing flushed yet.
        assert!(batches.lock().is_empty());
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(batches.lock().as_slice(), &[2]);
        submitter.close();
    }

    #[test]
    fn test_close_flushes_pending_data() {
        let (submitter, batches, _) = submitter_with_sink(100, Duration::from_secs(60));
        submitter.submit(envelope("a"));
        submitter.submit(envelope("b"));
        submitter.close();
        assert_eq!(batches.lock().as_slice(), &[2]);
    }

    #[test]
    fn test_submit_stamps_submit_time_once() {
        struct CapturingSink {
            stamps: Arc<Mutex<Vec<Option<String>>>>,
        }
        impl Sink for CapturingSink {
            fn name(&self) -> &str {
                "capture"
            }
            fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
                let mut stamps = self.stamps.lock();
                for env in batch {
                    stamps.push(env.submit_time.clone());
                }
                Ok(())
            }
        }

        let stamps = Arc::new(Mutex::new(Vec::new()));
        let submitter = BufferedSubmitter::new(
            Box::new(CapturingSink {
                stamps: stamps.clone(),
            }),
            1,
            Duration::from_secs(60),
        );
        let mut pre_stamped = envelope("pre");
        pre_stamped.submit_time = Some("1999-01-01 00:00:00".to_string());
        submitter.submit(pre_stamped);
        submitter.submit(envelope("fresh"));
        let stamps = stamps.lock();
        assert_eq!(stamps[0].as_deref(), Some("1999-01-01 00:00:00"));
        assert!(stamps[1].is_some());
        submitter.close();
    }

    #[test]
    fn test_slow_send_stays_single_flight() {
        /// A sink that parks until released, counting entries.
        struct SlowSink {
            entered: Arc<AtomicUsize>,
            release: Arc<AtomicBool>,
        }
        impl Sink for SlowSink {
            fn name(&self) -> &str {
                "slow"
            }
            fn drain(&mut self, _batch: &[ResultEnvelope]) -> Result<(), SinkError> {
                self.entered.fetch_add(1, Ordering::SeqCst);
                while !self.release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
        }

        let entered = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));
        let submitter = BufferedSubmitter::new(
            Box::new(SlowSink {
                entered: entered.clone(),
                release: release.clone(),
            }),
            2,
            Duration::from_millis(50),
        );

        let feeder = {
            let submitter = submitter.clone();
            std::thread::spawn(move || {
                submitter.submit(envelope("a"));
                submitter.submit(envelope("b")); // capacity send, parks in the sink
            })
        };
        // While the capacity flush is parked inside the sink, no second
        // drain call may stack up behind it.
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        release.store(true, Ordering::SeqCst);
        feeder.join().expect("feeder thread panicked");
        submitter.close();
    }
}
