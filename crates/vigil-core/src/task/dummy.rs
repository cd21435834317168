//! Fixed-text collector, mostly useful for wiring tests and liveness jobs.

use serde_json::Value;

use super::{Collector, RunContext, TaskError};

pub struct Dummy {
    text: String,
}

impl Dummy {
    pub fn new(text: String) -> Self {
        Self { text }
    }
}

impl Collector for Dummy {
    fn method(&self) -> &'static str {
        "dummy"
    }

    fn check(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn setup(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn collect(&mut self, ctx: &mut RunContext<'_>) -> Result<(), TaskError> {
        *ctx.value = Value::String(self.text.clone());
        Ok(())
    }

    fn teardown(&mut self) {}
}
