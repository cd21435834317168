//! Small shared helpers: wall-clock stamps and bounded thread joins.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use tracing::warn;

/// Local wall-clock stamp used in params and `submit_time` fields.
pub fn wall_clock() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Unix timestamp in seconds.
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Join a thread with a grace period, detach if stuck.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            warn!(thread = %name, "thread did not stop within the grace period, detaching");
            drop(handle);
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
