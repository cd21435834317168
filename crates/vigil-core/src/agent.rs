//! Agent assembly: wire the scheduler, pools and submitters together from
//! a validated configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{AgentConfig, ConfigError, SubmitConfig};
use crate::envelope::ResultEnvelope;
use crate::format::FormatRegistry;
use crate::job::Job;
use crate::pool::{Pool, PoolError, PoolMessage};
use crate::scheduler::Scheduler;
use crate::submit::{BufferedSubmitter, FileSink, HttpSink, PrintSink, Sink};

/// Bounded queue sizes between the pipeline stages.
pub const WORKER_QUEUE_SIZE: usize = 50;
pub const SUBMIT_QUEUE_SIZE: usize = 20;

/// Forwarding envelopes is cheap; one submit worker matches the original
/// deployment shape.
const SUBMIT_WORKERS: usize = 1;

/// The assembled pipeline. `start` brings the stages up back-to-front so a
/// dispatched job always finds its downstream ready; `stop` tears them down
/// front-to-back.
pub struct Agent {
    name: String,
    scheduler: Arc<Scheduler>,
    worker_pool: Pool<Arc<Job>>,
    submit_pool: Pool<ResultEnvelope>,
    submitters: Arc<Vec<Arc<BufferedSubmitter>>>,
    jobs: Vec<Arc<Job>>,
    started: bool,
}

impl Agent {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let formats = Arc::new(FormatRegistry::builtin());

        let jobs = config
            .perfmon
            .iter()
            .map(|job| Job::from_config(job, &formats))
            .collect::<Result<Vec<_>, _>>()?;

        let submitters = Arc::new(vec![build_submitter(config)?]);

        // Submit side: fan every envelope out to all registered submitters.
        let submit_pool = {
            let submitters = submitters.clone();
            Pool::new(
                "submit",
                SUBMIT_WORKERS,
                SUBMIT_QUEUE_SIZE,
                Arc::new(move |envelope: ResultEnvelope| {
                    for submitter in submitters.iter() {
                        submitter.submit(envelope.clone());
                    }
                    Ok(())
                }),
            )
        };

        // Worker side: run the job, push its envelope downstream, then
        // re-register the job for its next period.
        let scheduler = Scheduler::new();
        let worker_count = config.process.unwrap_or_else(num_cpus::get).max(1);
        let worker_pool = {
            let scheduler = scheduler.clone();
            let submit_tx = submit_pool.sender();
            Pool::new(
                "worker",
                worker_count,
                WORKER_QUEUE_SIZE,
                Arc::new(move |job: Arc<Job>| {
                    let mut params = job.generate_params();
                    let envelope = job.run(&mut params).ok_or_else(|| {
                        PoolError::Discard(format!("job '{}' produced no result", job.name))
                    })?;
                    if submit_tx.send(PoolMessage::Job(envelope)).is_err() {
                        warn!(job = %job.name, "submit queue closed, result dropped");
                    }
                    scheduler.register(job.clone());
                    Ok(())
                }),
            )
        };

        Ok(Self {
            name: config.agent_name.clone(),
            scheduler,
            worker_pool,
            submit_pool,
            submitters,
            jobs,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_pool.size()
    }

    /// Bring the pipeline up and schedule every configured job.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        info!(agent = %self.name, jobs = self.jobs.len(), workers = self.worker_pool.size(), "agent starting");
        self.submit_pool.start();
        self.worker_pool.start();
        for job in &self.jobs {
            self.scheduler.register(job.clone());
        }
        self.scheduler.start(self.worker_pool.sender());
        self.started = true;
    }

    /// Graceful shutdown: scheduler first (no new dispatches), then the
    /// pools in pipeline order, then a final flush of every submitter.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!(agent = %self.name, "agent stopping");
        self.scheduler.stop();
        self.worker_pool.stop();
        self.submit_pool.stop();
        for submitter in self.submitters.iter() {
            submitter.close();
        }
        self.started = false;
        info!(agent = %self.name, "agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_submitter(config: &AgentConfig) -> Result<Arc<BufferedSubmitter>, ConfigError> {
    let capacity = config.submit.capacity();
    let timeout = Duration::from_secs_f64(config.submit.flush_timeout());

    let sink: Box<dyn Sink> = match &config.submit {
        SubmitConfig::Print { device, format, .. } => Box::new(PrintSink::new(*device, *format)),
        SubmitConfig::File { path, .. } => {
            let path = path
                .clone()
                .or_else(|| config.report.as_ref().map(Into::into))
                .ok_or_else(|| {
                    ConfigError::Invalid("file submit has no destination path".into())
                })?;
            Box::new(FileSink::new(path).map_err(|e| {
                ConfigError::Invalid(format!("cannot open report file: {}", e))
            })?)
        }
        SubmitConfig::Http { url, retry, .. } => {
            let url = url
                .clone()
                .or_else(|| config.report.clone())
                .ok_or_else(|| ConfigError::Invalid("http submit has no report url".into()))?;
            Box::new(HttpSink::new(&url, *retry).map_err(|e| {
                ConfigError::Invalid(format!("cannot build http submitter: {}", e))
            })?)
        }
    };

    Ok(BufferedSubmitter::new(sink, capacity, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(raw: serde_json::Value) -> AgentConfig {
        let config: AgentConfig = serde_json::from_value(raw).expect("bad test config");
        config.validate().expect("invalid test config");
        config
    }

    #[test]
    fn test_agent_builds_from_print_config() {
        let config = config(json!({
            "agent_name": "t",
            "process": 2,
            "submit": {"type": "print", "device": "stderr", "format": "JsonEachRow"},
            "perfmon": [{"name": "hello", "type": "poll", "delay": 1.0,
                          "tasks": [{"method": "dummy", "text": "hi",
                                      "expect": "string", "timeout": 5.0}]}]
        }));
        let agent = Agent::from_config(&config).unwrap();
        assert_eq!(agent.job_count(), 1);
        assert_eq!(agent.worker_count(), 2);
    }

    #[test]
    fn test_file_submit_falls_back_to_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("out.jsonl");
        let config = config(json!({
            "agent_name": "t",
            "report": report.to_str().unwrap(),
            "submit": {"type": "file"},
            "perfmon": [{"name": "hello", "type": "poll", "delay": 1.0,
                          "tasks": [{"method": "dummy", "text": "hi",
                                      "expect": "string", "timeout": 5.0}]}]
        }));
        let agent = Agent::from_config(&config).unwrap();
        assert_eq!(agent.job_count(), 1);
        assert!(report.exists());
    }

    #[test]
    fn test_bad_job_aborts_construction() {
        let config = config(json!({
            "agent_name": "t",
            "submit": {"type": "print", "device": "stdout", "format": "JsonEachRow"},
            "perfmon": [{"name": "broken", "type": "poll", "delay": 1.0,
                          "tasks": [{"method": "readfile",
                                      "path": "/nonexistent/vigil-agent-test",
                                      "expect": "string", "timeout": 5.0}]}]
        }));
        assert!(Agent::from_config(&config).is_err());
    }

    #[test]
    fn test_start_stop_cycle() {
        let config = config(json!({
            "agent_name": "t",
            "process": 1,
            "submit": {"type": "print", "device": "stderr", "format": "JsonEachRow",
                        "capacity": 100, "timeout": 60.0},
            "perfmon": [{"name": "hello", "type": "poll", "delay": 60.0,
                          "tasks": [{"method": "dummy", "text": "hi",
                                      "expect": "string", "timeout": 5.0}]}]
        }));
        let mut agent = Agent::from_config(&config).unwrap();
        agent.start();
        agent.start();
        std::thread::sleep(Duration::from_millis(100));
        agent.stop();
        agent.stop();
    }
}
