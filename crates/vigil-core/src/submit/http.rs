//! HTTP sink: POST the JSON batch to a report endpoint.
//!
//! The endpoint contract follows the agent protocol: HTTP 200 with a JSON
//! body carrying `errno == 0` acknowledges the batch; anything else is a
//! failed send. Transport retries are bounded and local to this sink; the
//! buffered submitter above it handles longer-term redelivery.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::envelope::ResultEnvelope;

use super::{Sink, SinkError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("vigil/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct ReportAck {
    errno: i64,
    #[serde(default)]
    error: String,
}

pub struct HttpSink {
    url: String,
    retry: u32,
    client: Client,
}

impl HttpSink {
    pub fn new(url: &str, retry: u32) -> Result<Self, SinkError> {
        reqwest::Url::parse(url)
            .map_err(|e| SinkError::Other(format!("invalid report url '{}': {}", url, e)))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            url: url.to_string(),
            retry: retry.max(1),
            client,
        })
    }

    fn post_batch(&self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(&batch).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(format!(
                "response status code '{}'",
                status.as_u16()
            )));
        }
        let ack: ReportAck = response.json()?;
        if ack.errno != 0 {
            return Err(SinkError::Rejected(format!(
                "errno {}{}",
                ack.errno,
                if ack.error.is_empty() {
                    String::new()
                } else {
                    format!(": {}", ack.error)
                }
            )));
        }
        Ok(())
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    fn drain(&mut self, batch: &[ResultEnvelope]) -> Result<(), SinkError> {
        let mut attempts = Vec::new();
        for attempt in 1..=self.retry {
            match self.post_batch(batch) {
                Ok(()) => {
                    debug!(count = batch.len(), attempt, "batch posted");
                    return Ok(());
                }
                Err(e) => attempts.push(format!("(try {}): {}", attempt, e)),
            }
        }
        Err(SinkError::Rejected(attempts.join("; ")))
    }
}
