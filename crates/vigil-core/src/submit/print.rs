//! Print sink: one record per line on stdout or stderr.

use std::io::Write;

use crate::config::{PrintDevice, PrintFormat};
use crate::envelope::ResultEnvelope;
use tracing::debug;

use super::{Sink, SinkError};

pub struct PrintSink {
    device: PrintDevice,
    format: PrintFormat,
}

impl PrintSink {
    pub fn new(device: PrintDevice, format: PrintFormat) -> Self {
        Self { device, format }
    }

    fn render(&self, envelope: &ResultEnvelope) -> Result<String, SinkError> {
        match self.format {
            PrintFormat::JsonEachRow => Ok(serde_json::to_string(envelope)?),
            PrintFormat::DebugRepr => Ok(format!("{:?}", envelope)),
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        match self.device {
            PrintDevice::Stdout => writeln!(std::io::stdout().lock(), "{}", line),
            PrintDevice::Stderr => writeln!(std::io::stderr().lock(), "{}", line),
        }
    }
}

impl Sink for PrintSink {
    fn name(&self) -> &str {
        "print"
    }

    fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
        for envelope in batch {
            let line = self.render(envelope)?;
            self.write_line(&line)?;
        }
        debug!(count = batch.len(), "batch written to console");
        Ok(())
    }
}
