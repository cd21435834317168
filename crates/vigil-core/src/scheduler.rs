//! Priority time-ordered dispatch loop.
//!
//! Pending entries live in a min-heap ordered by (due time, priority,
//! insertion order). One control thread sleeps on a condvar until the
//! earliest entry is due, pops every due entry and hands it to the worker
//! queue. Jobs re-register themselves after their run completes, so the
//! period is measured from completion: a slow job pushes its own next run
//! later instead of piling up.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::job::Job;
use crate::pool::PoolMessage;
use crate::util::join_with_timeout;

const STOP_GRACE: Duration = Duration::from_secs(2);

struct ScheduleEntry {
    due: Instant,
    priority: i64,
    /// Registration order, the final tie-break.
    seq: u64,
    job: Arc<Job>,
}

// Reverse ordering on all three keys for a min-heap: earliest due first,
// then lowest priority value, then earliest registration.
impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ScheduleEntry {}

struct SchedState {
    pending: BinaryHeap<ScheduleEntry>,
}

/// The dispatch loop plus its pending set. Shared as an `Arc` so worker
/// threads can re-register completed jobs.
pub struct Scheduler {
    state: Mutex<SchedState>,
    notify: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState {
                pending: BinaryHeap::new(),
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// Insert a job with due time `now + delay`. Called both at startup and
    /// by the worker-side completion callback, which makes the schedule
    /// self-perpetuating.
    pub fn register(&self, job: Arc<Job>) {
        if self.shutdown.load(Ordering::Acquire) {
            debug!(job = %job.name, "scheduler stopped, registration dropped");
            return;
        }
        let due = Instant::now() + job.delay;
        self.register_at(job, due);
    }

    fn register_at(&self, job: Arc<Job>, due: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        trace!(job = %job.name, priority = job.priority, seq, "job registered");
        let mut state = self.state.lock();
        state.pending.push(ScheduleEntry {
            due,
            priority: job.priority,
            seq,
            job,
        });
        self.notify.notify_one();
    }

    /// Pending entry count, for introspection and tests.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Start the dispatch thread. Due jobs are pushed into `dispatch`; the
    /// send blocks when the worker queue is full, applying backpressure
    /// without holding the pending-set lock.
    pub fn start(self: &Arc<Self>, dispatch: Sender<PoolMessage<Arc<Job>>>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *handle = Some(
            thread::Builder::new()
                .name("sched".to_string())
                .spawn(move || scheduler.run_loop(dispatch))
                .expect("Failed to spawn scheduler thread"),
        );
        info!("scheduler started");
    }

    fn run_loop(&self, dispatch: Sender<PoolMessage<Arc<Job>>>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let mut due_jobs = Vec::new();
            {
                let mut state = self.state.lock();
                // Re-check after acquiring the lock: stop() may have set the
                // flag and fired the condvar between our check and the lock.
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let now = Instant::now();
                while state
                    .pending
                    .peek()
                    .is_some_and(|entry| entry.due <= now)
                {
                    if let Some(entry) = state.pending.pop() {
                        due_jobs.push(entry.job);
                    }
                }

                if due_jobs.is_empty() {
                    match state.pending.peek() {
                        Some(next) => {
                            let timeout = next.due.saturating_duration_since(Instant::now());
                            self.notify.wait_for(&mut state, timeout);
                        }
                        None => self.notify.wait(&mut state),
                    }
                    continue;
                }
            }

            // Lock released: a blocking dispatch must not stall register().
            for job in due_jobs {
                debug!(job = %job.name, "dispatching due job");
                if dispatch.send(PoolMessage::Job(job)).is_err() {
                    warn!("worker queue closed, dispatch dropped");
                }
            }
        }
        debug!("scheduler loop exited");
    }

    /// Cancel every pending entry and stop the dispatch thread. Dispatches
    /// already handed to the worker queue are not recalled.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            let cancelled = state.pending.len();
            state.pending.clear();
            if cancelled > 0 {
                debug!(cancelled, "pending schedule entries cancelled");
            }
        }
        self.notify.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, STOP_GRACE, "sched");
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::format::FormatRegistry;
    use crossbeam::channel;
    use serde_json::json;

    fn job(name: &str, delay: f64, priority: i64) -> Arc<Job> {
        let config: JobConfig = serde_json::from_value(json!({
            "name": name, "type": "poll", "delay": delay, "priority": priority,
            "tasks": [{"method": "dummy", "text": "x", "expect": "string",
                        "timeout": 5.0, "retry": 1}]
        }))
        .unwrap();
        Job::from_config(&config, &Arc::new(FormatRegistry::builtin())).unwrap()
    }

    fn recv_job(
        rx: &channel::Receiver<PoolMessage<Arc<Job>>>,
        timeout: Duration,
    ) -> Option<Arc<Job>> {
        match rx.recv_timeout(timeout) {
            Ok(PoolMessage::Job(job)) => Some(job),
            _ => None,
        }
    }

    #[test]
    fn test_dispatches_when_due() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel::bounded(8);
        scheduler.start(tx);
        scheduler.register(job("fast", 0.05, 0));

        let dispatched = recv_job(&rx, Duration::from_secs(2)).expect("no dispatch");
        assert_eq!(dispatched.name, "fast");
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.stop();
    }

    #[test]
    fn test_priority_breaks_due_time_ties() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel::bounded(8);

        // Same due instant, registered low-priority-value job last: it must
        // still dispatch first.
        let due = Instant::now() + Duration::from_millis(50);
        scheduler.register_at(job("a", 1.0, 1), due);
        scheduler.register_at(job("b", 1.0, 0), due);
        scheduler.start(tx);

        let first = recv_job(&rx, Duration::from_secs(2)).expect("no first dispatch");
        let second = recv_job(&rx, Duration::from_secs(2)).expect("no second dispatch");
        assert_eq!(first.name, "b");
        assert_eq!(second.name, "a");
        scheduler.stop();
    }

    #[test]
    fn test_registration_order_is_final_tiebreak() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel::bounded(8);

        let due = Instant::now() + Duration::from_millis(50);
        scheduler.register_at(job("first", 1.0, 5), due);
        scheduler.register_at(job("second", 1.0, 5), due);
        scheduler.start(tx);

        assert_eq!(
            recv_job(&rx, Duration::from_secs(2)).expect("no dispatch").name,
            "first"
        );
        assert_eq!(
            recv_job(&rx, Duration::from_secs(2)).expect("no dispatch").name,
            "second"
        );
        scheduler.stop();
    }

    #[test]
    fn test_earlier_due_wins_over_priority() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel::bounded(8);

        let now = Instant::now();
        scheduler.register_at(job("later-high", 1.0, 0), now + Duration::from_millis(150));
        scheduler.register_at(job("sooner-low", 1.0, 9), now + Duration::from_millis(50));
        scheduler.start(tx);

        assert_eq!(
            recv_job(&rx, Duration::from_secs(2)).expect("no dispatch").name,
            "sooner-low"
        );
        scheduler.stop();
    }

    #[test]
    fn test_stop_cancels_pending_entries() {
        let scheduler = Scheduler::new();
        let (tx, rx) = channel::bounded(8);
        scheduler.start(tx);
        scheduler.register(job("slow", 30.0, 0));
        assert_eq!(scheduler.pending_count(), 1);

        scheduler.stop();
        assert_eq!(scheduler.pending_count(), 0);
        assert!(recv_job(&rx, Duration::from_millis(200)).is_none());
    }

    #[test]
    fn test_register_after_stop_is_dropped() {
        let scheduler = Scheduler::new();
        let (tx, _rx) = channel::bounded(8);
        scheduler.start(tx);
        scheduler.stop();
        scheduler.register(job("late", 0.01, 0));
        assert_eq!(scheduler.pending_count(), 0);
    }
}
