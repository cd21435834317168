//! Timeout/retry state machine driving one collection task.
//!
//! Each runner owns a single reentrant timer reused across attempts, so at
//! most one timeout countdown exists per task at any instant. The timer
//! trips a cancel token instead of signalling the process; collector bodies
//! observe the token and bail out on their own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{build_collector, CancelToken, Collector, RunContext, TaskError};
use crate::config::TaskConfig;
use crate::envelope::{Cmd, Params, ResultEnvelope};
use crate::expect::Expect;
use crate::format::{FormatRegistry, FormatSpec};
use crate::timer::ReentrantTimer;
use crate::util::unix_timestamp;

pub struct TaskRunner {
    /// Owning job name; carried as the envelope name.
    name: String,
    method: &'static str,
    format: FormatSpec,
    expect: Expect,
    timeout: Duration,
    timeout_secs: f64,
    retry: u32,
    formats: Arc<FormatRegistry>,
    collector: Box<dyn Collector>,
    cancel: CancelToken,
    timer: ReentrantTimer,
    value: Value,
    error: Option<TaskError>,
}

impl TaskRunner {
    /// Build a runner from a task config. Runs the collector's `check` and
    /// `setup`, so a bad config fails here, before anything is scheduled.
    pub fn new(
        job_name: &str,
        config: &TaskConfig,
        formats: Arc<FormatRegistry>,
    ) -> Result<Self, TaskError> {
        let collector = build_collector(&config.method, config.timeout);
        Self::from_parts(
            job_name,
            collector,
            config.format.clone(),
            config.expect,
            config.timeout,
            config.retry,
            formats,
        )
    }

    fn from_parts(
        job_name: &str,
        mut collector: Box<dyn Collector>,
        format: FormatSpec,
        expect: Expect,
        timeout: f64,
        retry: u32,
        formats: Arc<FormatRegistry>,
    ) -> Result<Self, TaskError> {
        collector.check()?;
        collector.setup()?;

        let method = collector.method();
        let cancel = CancelToken::new();
        let timer = {
            let cancel = cancel.clone();
            let label = format!("{}-{}", job_name, method);
            let watched = label.clone();
            ReentrantTimer::spawn(&label, move || {
                debug!(task = %watched, "task reached timeout");
                cancel.cancel();
            })
        };

        Ok(Self {
            name: job_name.to_string(),
            method,
            format,
            expect,
            timeout: Duration::from_secs_f64(timeout),
            timeout_secs: timeout,
            retry,
            formats,
            collector,
            cancel,
            timer,
            value: Value::Null,
            error: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Run the task with retry. Every attempt is bounded by the timeout
    /// timer; a tripped attempt counts as a failure and the next attempt
    /// starts with a fresh countdown.
    pub fn run(&mut self, params: &mut Params) {
        self.error = None;
        for attempt in 1..=self.retry {
            self.cancel.reset();
            self.value = Value::Null;
            if let Err(e) = self.timer.arm(self.timeout) {
                self.error = Some(TaskError::Failed(e.to_string()));
                break;
            }

            let body = {
                let mut ctx = RunContext {
                    params: &mut *params,
                    value: &mut self.value,
                    cancel: &self.cancel,
                };
                self.collector.collect(&mut ctx)
            };
            let _ = self.timer.disarm();

            // The tripped token wins over whatever the body returned: the
            // attempt is recorded as timed out either way.
            let outcome = if self.cancel.is_cancelled() {
                Err(TaskError::Timeout {
                    timeout: self.timeout_secs,
                })
            } else {
                body.and_then(|()| self.refine_value())
            };

            match outcome {
                Ok(()) => {
                    self.error = None;
                    debug!(task = %self.name, method = self.method, attempt, "task succeeded");
                    break;
                }
                Err(e) => {
                    warn!(
                        task = %self.name,
                        method = self.method,
                        attempt,
                        retry = self.retry,
                        error = %e,
                        "task attempt failed"
                    );
                    self.error = Some(e);
                }
            }
        }
        let _ = self.timer.disarm();
    }

    /// Format pipeline, then expect coercion. On a format error the raw
    /// collected value stays in place; on an expect error the formatted one
    /// does.
    fn refine_value(&mut self) -> Result<(), TaskError> {
        self.value = self.formats.apply(&self.format, self.value.clone())?;
        self.value = self.expect.coerce(self.value.clone())?;
        Ok(())
    }

    fn errno(&self) -> u8 {
        u8::from(self.error.is_some())
    }

    fn error_text(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    /// Sub-result recorded under the job's `_step` map: the envelope fields
    /// minus the shared params.
    pub fn step_value(&self) -> Value {
        json!({
            "cmd": if self.error.is_none() { "result" } else { "error" },
            "name": self.name,
            "expect": self.expect,
            "value": self.value,
            "errno": self.errno(),
            "error": self.error_text(),
            "timestamp": unix_timestamp(),
        })
    }

    /// Envelope for the state left behind by the last `run`.
    pub fn result(&self, params: &Params) -> ResultEnvelope {
        ResultEnvelope {
            cmd: if self.error.is_none() {
                Cmd::Result
            } else {
                Cmd::Error
            },
            name: self.name.clone(),
            params: params.clone(),
            expect: self.expect,
            value: self.value.clone(),
            errno: self.errno(),
            error: self.error_text(),
            timestamp: unix_timestamp(),
            submit_time: None,
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.collector.teardown();
    }
}
