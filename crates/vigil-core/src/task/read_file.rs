//! Bounded file-read collector.
//!
//! Reads up to `length` bytes from the start of a file on every run. The
//! handle lifecycle follows the configured close policy; reads are treated
//! as fast and are not cancellable.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use super::{Collector, RunContext, TaskError};
use crate::config::ClosePolicy;

pub struct ReadFile {
    path: PathBuf,
    length: usize,
    close: ClosePolicy,
    file: Option<File>,
}

impl ReadFile {
    pub fn new(path: PathBuf, length: usize, close: ClosePolicy) -> Self {
        Self {
            path,
            length,
            close,
            file: None,
        }
    }

    fn open(&mut self) -> Result<&mut File, TaskError> {
        if self.file.is_none() {
            debug!(path = %self.path.display(), "opening watched file");
            self.file = Some(File::open(&self.path)?);
        }
        // Just inserted above when absent.
        self.file
            .as_mut()
            .ok_or_else(|| TaskError::Failed("file handle unavailable".into()))
    }

    fn read_head(&mut self) -> Result<String, TaskError> {
        let length = self.length;
        let file = self.open()?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(length.min(64 * 1024));
        file.take(length as u64).read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Collector for ReadFile {
    fn method(&self) -> &'static str {
        "readfile"
    }

    fn check(&self) -> Result<(), TaskError> {
        if !self.path.is_absolute() {
            return Err(TaskError::Config(format!(
                "'readfile' path '{}' must be absolute",
                self.path.display()
            )));
        }
        if !self.path.is_file() {
            return Err(TaskError::Config(format!(
                "'readfile' path '{}' must be a regular file",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn setup(&mut self) -> Result<(), TaskError> {
        self.open()?;
        Ok(())
    }

    fn collect(&mut self, ctx: &mut RunContext<'_>) -> Result<(), TaskError> {
        if self.close == ClosePolicy::Always {
            self.file = None;
        }
        match self.read_head() {
            Ok(text) => {
                *ctx.value = Value::String(text);
                if self.close == ClosePolicy::Always {
                    self.file = None;
                }
                Ok(())
            }
            Err(e) => {
                if self.close != ClosePolicy::Never {
                    self.file = None;
                }
                Err(e)
            }
        }
    }

    fn teardown(&mut self) {
        self.file = None;
    }
}
