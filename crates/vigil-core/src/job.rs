//! A named periodic job: an ordered list of task runners sharing one
//! (delay, priority) schedule.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{ConfigError, JobConfig};
use crate::envelope::{Params, ResultEnvelope};
use crate::format::FormatRegistry;
use crate::task::TaskRunner;
use crate::util::wall_clock;

/// Immutable after construction; the scheduler owns the `Arc` and worker
/// dispatches share it. The runners carry the only mutable task state and
/// each lives behind its own mutex; the scheduler guarantees a job is
/// never dispatched while its previous run is still in flight, so the
/// locks are uncontended in practice.
pub struct Job {
    pub name: String,
    pub delay: Duration,
    pub priority: i64,
    tasks: Vec<Mutex<TaskRunner>>,
}

impl Job {
    /// Build a job and its runners. Collector checks run here, so an
    /// invalid task aborts startup.
    pub fn from_config(
        config: &JobConfig,
        formats: &Arc<FormatRegistry>,
    ) -> Result<Arc<Self>, ConfigError> {
        let mut tasks = Vec::with_capacity(config.tasks.len());
        for task in &config.tasks {
            let runner = TaskRunner::new(&config.name, task, formats.clone()).map_err(|e| {
                ConfigError::Invalid(format!(
                    "job '{}' task '{}': {}",
                    config.name, task.method, e
                ))
            })?;
            tasks.push(Mutex::new(runner));
        }
        Ok(Arc::new(Self {
            name: config.name.clone(),
            delay: Duration::from_secs_f64(config.delay),
            priority: config.priority,
            tasks,
        }))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Fresh collection-time context for one run.
    pub fn generate_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("datetime".to_string(), Value::String(wall_clock()));
        params
    }

    /// Run every task in order against the shared params, accumulating
    /// per-task sub-results under `_step`, and return the final envelope
    /// (the last task's result over the full context).
    pub fn run(&self, params: &mut Params) -> Option<ResultEnvelope> {
        debug!(job = %self.name, tasks = self.tasks.len(), "job running");
        let mut envelope = None;
        for (index, slot) in self.tasks.iter().enumerate() {
            let mut runner = slot.lock();
            runner.run(params);
            Self::record_step(params, index, runner.method(), runner.step_value());
            envelope = Some(runner.result(params));
        }
        if envelope.is_none() {
            warn!(job = %self.name, "job has no tasks and produced no result");
        }
        envelope
    }

    /// Insert one sub-result into the `_step` map, keyed by method name
    /// (suffixed with the position when a job repeats a method).
    fn record_step(params: &mut Params, index: usize, method: &str, step: Value) {
        let steps = params
            .entry("_step")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = steps {
            let key = if map.contains_key(method) {
                format!("{}#{}", method, index)
            } else {
                method.to_string()
            };
            map.insert(key, step);
        }
    }
}
