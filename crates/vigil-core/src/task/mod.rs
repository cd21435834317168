//! Collection tasks: the capability contract and the built-in collectors.

mod dummy;
mod execute;
mod read_file;
mod runner;

pub use dummy::Dummy;
pub use execute::Execute;
pub use read_file::ReadFile;
pub use runner::TaskRunner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::config::MethodConfig;
use crate::envelope::Params;
use crate::expect::ExpectError;
use crate::format::FormatError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The attempt ran past its configured bound.
    #[error("running time exceeded {timeout:.1}s")]
    Timeout { timeout: f64 },

    /// Static configuration problem, raised at construction.
    #[error("invalid task configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Expect(#[from] ExpectError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A program ran to completion but reported failure.
    #[error("program '{program}' exited with code '{code}'")]
    Exit { program: String, code: i32 },

    #[error("{0}")]
    Failed(String),
}

/// Cancellation flag tripped by the runner's timeout timer and polled by
/// collectors with interruptible bodies.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-attempt context handed to a collector body.
pub struct RunContext<'a> {
    /// Collection-time context; collectors may record extras such as
    /// `_returncode` here.
    pub params: &'a mut Params,
    /// Where the collected value lands. Set even when the body errors, so
    /// partial output (e.g. captured stdout) reaches the envelope.
    pub value: &'a mut serde_json::Value,
    /// Tripped when the attempt's timeout fires; long-running bodies must
    /// poll it and bail out.
    pub cancel: &'a CancelToken,
}

/// Capability contract implemented by concrete collectors.
pub trait Collector: Send {
    /// Method identifier, e.g. `"dummy"`.
    fn method(&self) -> &'static str;

    /// Static validation of the configuration. Run once at construction;
    /// a failure here aborts startup.
    fn check(&self) -> Result<(), TaskError>;

    /// One-time resource acquisition.
    fn setup(&mut self) -> Result<(), TaskError>;

    /// Perform the collection: set `ctx.value` or return an error.
    fn collect(&mut self, ctx: &mut RunContext<'_>) -> Result<(), TaskError>;

    /// Release held resources (files, subprocesses).
    fn teardown(&mut self);
}

/// Instantiate the collector for a method config. `timeout` is the task's
/// per-attempt bound, used as the default subprocess wait.
pub fn build_collector(method: &MethodConfig, timeout: f64) -> Box<dyn Collector> {
    match method {
        MethodConfig::Dummy { text } => Box::new(Dummy::new(text.clone())),
        MethodConfig::ReadFile {
            path,
            length,
            close,
        } => Box::new(ReadFile::new(path.clone(), *length, *close)),
        MethodConfig::Execute {
            exec,
            params,
            stdin,
            wait,
        } => Box::new(Execute::new(
            exec.clone(),
            params.clone(),
            stdin.clone(),
            wait.unwrap_or(timeout),
        )),
    }
}
