//! Subprocess collector: run a program, feed stdin, capture output and the
//! exit code.
//!
//! The wait loop polls `try_wait` against both the cancel token and the
//! configured wait bound, then kills the child, so a timeout never leaks a
//! process or relies on process-wide signals.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use super::{CancelToken, Collector, RunContext, TaskError};

/// How much of stdout/stderr is captured into the envelope.
const CAPTURE_LIMIT: u64 = 4096;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Execute {
    exec: String,
    args: Vec<String>,
    stdin: String,
    /// Subprocess wait bound in seconds.
    wait: f64,
    child: Option<Child>,
}

impl Execute {
    pub fn new(exec: String, args: Vec<String>, stdin: String, wait: f64) -> Self {
        Self {
            exec,
            args,
            stdin,
            wait,
            child: None,
        }
    }

    /// Poll the child until it exits, the cancel token trips, or the wait
    /// bound passes; overruns are killed and reaped.
    fn wait_for_exit(
        child: &mut Child,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<Option<ExitStatus>, TaskError> {
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(Some(status)),
                None => {
                    if cancel.is_cancelled() || Instant::now() >= deadline {
                        Self::kill_child(child);
                        return Ok(child.try_wait()?);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn kill_child(child: &mut Child) {
        // std's kill is SIGKILL; the child gets no grace beyond the poll loop.
        if let Err(e) = child.kill() {
            warn!(error = %e, "failed to kill timed-out child");
        }
        let _ = child.wait();
    }

    fn read_capped(stream: Option<impl Read>) -> String {
        let mut buf = Vec::new();
        if let Some(stream) = stream {
            let _ = stream.take(CAPTURE_LIMIT).read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Collector for Execute {
    fn method(&self) -> &'static str {
        "execute"
    }

    fn check(&self) -> Result<(), TaskError> {
        if self.exec.is_empty() {
            return Err(TaskError::Config("'execute' exec command is empty".into()));
        }
        if self.wait <= 0.0 {
            return Err(TaskError::Config(format!(
                "'execute' wait bound must be positive, got {}",
                self.wait
            )));
        }
        Ok(())
    }

    fn setup(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn collect(&mut self, ctx: &mut RunContext<'_>) -> Result<(), TaskError> {
        let mut child = Command::new(&self.exec)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            if !self.stdin.is_empty() {
                if let Err(e) = stdin.write_all(self.stdin.as_bytes()) {
                    warn!(error = %e, "stdin data not delivered to program");
                }
            }
            // Dropping the handle closes the pipe so the child sees EOF.
        }

        let deadline = Instant::now() + Duration::from_secs_f64(self.wait);

        // Park the handle on self while waiting; if the wait errors out,
        // teardown still reaps the child.
        self.child = Some(child);
        let status = {
            let child = self
                .child
                .as_mut()
                .ok_or_else(|| TaskError::Failed("child handle vanished".into()))?;
            Self::wait_for_exit(child, ctx.cancel, deadline)?
        };
        let mut child = self
            .child
            .take()
            .ok_or_else(|| TaskError::Failed("child handle vanished".into()))?;

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let stdout = Self::read_capped(child.stdout.take());
        let stderr = Self::read_capped(child.stderr.take());

        debug!(program = %self.exec, exit_code, "program finished");
        ctx.params
            .insert("_returncode".to_string(), Value::from(exit_code));
        ctx.params
            .insert("_stderr".to_string(), Value::String(stderr));
        *ctx.value = Value::String(stdout);

        if exit_code != 0 {
            return Err(TaskError::Exit {
                program: self.exec.clone(),
                code: exit_code,
            });
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                Self::kill_child(&mut child);
            }
        }
    }
}
