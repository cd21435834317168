//! File sink: append-only JSON lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::debug;

use crate::envelope::ResultEnvelope;

use super::{Sink, SinkError};

pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Open (creating if needed) the report file for appending.
    pub fn new(path: PathBuf) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
        for envelope in batch {
            let line = serde_json::to_string(envelope)?;
            self.file.write_all(line.as_bytes())?;
            self.file.write_all(b"\n")?;
        }
        self.file.flush()?;
        debug!(count = batch.len(), path = %self.path.display(), "batch appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Cmd, Params};
    use crate::expect::Expect;
    use serde_json::Value;

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

    #[test]
    fn test_appends_one_json_line_per_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let mut sink = FileSink::new(path.clone()).unwrap();

        sink.drain(&[envelope("a"), envelope("b")]).unwrap();
        sink.drain(&[envelope("c")]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["errno"], Value::from(0));
        }
    }
}
