//! Agent configuration: JSON file structure and startup validation.
//!
//! Every configuration problem is fatal and surfaces before any worker
//! thread starts.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::expect::Expect;
use crate::format::FormatSpec;

pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_PRIORITY: i64 = 10;
pub const DEFAULT_READ_LENGTH: usize = 4096;
pub const DEFAULT_BUFFER_CAPACITY: usize = 20;
pub const DEFAULT_FLUSH_TIMEOUT: f64 = 10.0;
pub const DEFAULT_HTTP_RETRY: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file '{path}' is not valid: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent_name: String,
    /// Report destination, used by the file and http submit types when they
    /// carry no destination of their own.
    #[serde(default)]
    pub report: Option<String>,
    /// Worker thread count; defaults to the CPU count when absent.
    #[serde(default)]
    pub process: Option<usize>,
    pub submit: SubmitConfig,
    #[serde(deserialize_with = "one_or_many")]
    pub perfmon: Vec<JobConfig>,
}

impl AgentConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Value-level checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_name.is_empty() {
            return Err(ConfigError::Invalid("'agent_name' must not be empty".into()));
        }
        if self.perfmon.is_empty() {
            return Err(ConfigError::Invalid(
                "'perfmon' must define at least one job".into(),
            ));
        }
        for job in &self.perfmon {
            job.validate()?;
        }
        self.submit.validate(self.report.as_deref())?;
        Ok(())
    }
}

/// One periodic job: a (delay, priority) schedule over an ordered task list.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Re-fire interval in seconds, measured from run completion.
    pub delay: f64,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(deserialize_with = "one_or_many")]
    pub tasks: Vec<TaskConfig>,
}

impl JobConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("job 'name' must not be empty".into()));
        }
        if self.delay <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "job '{}' needs a positive 'delay', got {}",
                self.name, self.delay
            )));
        }
        if self.tasks.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "job '{}' needs at least one task",
                self.name
            )));
        }
        for task in &self.tasks {
            task.validate(&self.name)?;
        }
        Ok(())
    }
}

/// One collection task inside a job.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(flatten)]
    pub method: MethodConfig,
    #[serde(default)]
    pub format: FormatSpec,
    pub expect: Expect,
    /// Per-attempt bound in seconds.
    pub timeout: f64,
    #[serde(default = "default_retry")]
    pub retry: u32,
}

impl TaskConfig {
    fn validate(&self, job: &str) -> Result<(), ConfigError> {
        if self.timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "job '{}' task '{}' needs a positive 'timeout', got {}",
                job,
                self.method,
                self.timeout
            )));
        }
        if self.retry == 0 {
            return Err(ConfigError::Invalid(format!(
                "job '{}' task '{}' needs 'retry' >= 1",
                job, self.method
            )));
        }
        self.method.validate(job)
    }
}

/// Method selector plus its method-specific fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method")]
pub enum MethodConfig {
    #[serde(rename = "dummy")]
    Dummy { text: String },

    #[serde(rename = "readfile")]
    ReadFile {
        path: PathBuf,
        #[serde(default = "default_read_length")]
        length: usize,
        #[serde(default)]
        close: ClosePolicy,
    },

    #[serde(rename = "execute")]
    Execute {
        exec: String,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        stdin: String,
        /// Subprocess wait bound in seconds; defaults to the task timeout.
        #[serde(default)]
        wait: Option<f64>,
    },
}

impl MethodConfig {
    pub fn name(&self) -> &'static str {
        match self {
            MethodConfig::Dummy { .. } => "dummy",
            MethodConfig::ReadFile { .. } => "readfile",
            MethodConfig::Execute { .. } => "execute",
        }
    }

    fn validate(&self, job: &str) -> Result<(), ConfigError> {
        match self {
            MethodConfig::Dummy { .. } => Ok(()),
            MethodConfig::ReadFile { path, length, .. } => {
                if !path.is_absolute() {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': 'readfile' path '{}' must be absolute",
                        job,
                        path.display()
                    )));
                }
                if *length == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': 'readfile' length cannot be zero",
                        job
                    )));
                }
                Ok(())
            }
            MethodConfig::Execute { exec, wait, .. } => {
                if exec.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': 'execute' task needs a non-empty 'exec'",
                        job
                    )));
                }
                if let Some(wait) = wait {
                    if *wait <= 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "job '{}': 'execute' wait must be positive, got {}",
                            job, wait
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MethodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// File handle policy of the readfile collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Close and reopen on every read.
    Always,
    /// Keep the file open, seek back to the start each read.
    #[default]
    Never,
    /// Close on a read error, reopen on the next run.
    OnException,
}

/// Sink selection with its buffering parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubmitConfig {
    Print {
        device: PrintDevice,
        format: PrintFormat,
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default = "default_flush_timeout")]
        timeout: f64,
    },
    File {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default = "default_flush_timeout")]
        timeout: f64,
    },
    Http {
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_http_retry")]
        retry: u32,
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default = "default_flush_timeout")]
        timeout: f64,
    },
}

impl SubmitConfig {
    pub fn capacity(&self) -> usize {
        match self {
            SubmitConfig::Print { capacity, .. }
            | SubmitConfig::File { capacity, .. }
            | SubmitConfig::Http { capacity, .. } => *capacity,
        }
    }

    pub fn flush_timeout(&self) -> f64 {
        match self {
            SubmitConfig::Print { timeout, .. }
            | SubmitConfig::File { timeout, .. }
            | SubmitConfig::Http { timeout, .. } => *timeout,
        }
    }

    fn validate(&self, report: Option<&str>) -> Result<(), ConfigError> {
        if self.capacity() == 0 {
            return Err(ConfigError::Invalid(
                "submit 'capacity' cannot be zero".into(),
            ));
        }
        if self.flush_timeout() <= 0.0 {
            return Err(ConfigError::Invalid(
                "submit 'timeout' must be positive".into(),
            ));
        }
        match self {
            SubmitConfig::Print { .. } => Ok(()),
            SubmitConfig::File { path, .. } => {
                if path.is_none() && report.is_none() {
                    return Err(ConfigError::Invalid(
                        "file submit needs 'submit.path' or a top-level 'report'".into(),
                    ));
                }
                Ok(())
            }
            SubmitConfig::Http { url, retry, .. } => {
                if url.is_none() && report.is_none() {
                    return Err(ConfigError::Invalid(
                        "http submit needs 'submit.url' or a top-level 'report'".into(),
                    ));
                }
                if *retry == 0 {
                    return Err(ConfigError::Invalid("http submit needs 'retry' >= 1".into()));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintDevice {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PrintFormat {
    JsonEachRow,
    DebugRepr,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_retry() -> u32 {
    DEFAULT_RETRY
}

fn default_read_length() -> usize {
    DEFAULT_READ_LENGTH
}

fn default_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_flush_timeout() -> f64 {
    DEFAULT_FLUSH_TIMEOUT
}

fn default_http_retry() -> u32 {
    DEFAULT_HTTP_RETRY
}

/// Accept either a single object or a list of them, as the original config
/// format does for `perfmon` and `tasks`.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "agent_name": "host-1",
            "report": "/tmp/report.jsonl",
            "process": 2,
            "submit": {"type": "print", "device": "stdout", "format": "JsonEachRow"},
            "perfmon": [
                {
                    "name": "hello",
                    "type": "poll",
                    "delay": 1.0,
                    "priority": 5,
                    "tasks": [
                        {"method": "dummy", "text": "hi", "format": null,
                         "expect": "string", "timeout": 5.0, "retry": 1}
                    ]
                }
            ]
        })
    }

    #[test]
    fn test_parses_sample_config() {
        let config: AgentConfig = serde_json::from_value(sample()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.agent_name, "host-1");
        assert_eq!(config.process, Some(2));
        assert_eq!(config.perfmon.len(), 1);
        let job = &config.perfmon[0];
        assert_eq!(job.priority, 5);
        assert_eq!(job.tasks[0].retry, 1);
        assert_eq!(job.tasks[0].format, FormatSpec::None);
    }

    #[test]
    fn test_task_and_priority_defaults() {
        let mut raw = sample();
        raw["perfmon"][0].as_object_mut().unwrap().remove("priority");
        raw["perfmon"][0]["tasks"][0]
            .as_object_mut()
            .unwrap()
            .remove("retry");
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.perfmon[0].priority, DEFAULT_PRIORITY);
        assert_eq!(config.perfmon[0].tasks[0].retry, DEFAULT_RETRY);
    }

    #[test]
    fn test_single_task_object_accepted() {
        let mut raw = sample();
        let task = raw["perfmon"][0]["tasks"][0].clone();
        raw["perfmon"][0]["tasks"] = task;
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.perfmon[0].tasks.len(), 1);
    }

    #[test]
    fn test_missing_agent_name_rejected() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("agent_name");
        assert!(serde_json::from_value::<AgentConfig>(raw).is_err());
    }

    #[test]
    fn test_non_positive_delay_rejected() {
        let mut raw = sample();
        raw["perfmon"][0]["delay"] = json!(0.0);
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut raw = sample();
        raw["perfmon"][0]["tasks"][0]["method"] = json!("teleport");
        assert!(serde_json::from_value::<AgentConfig>(raw).is_err());
    }

    #[test]
    fn test_readfile_requires_absolute_path() {
        let mut raw = sample();
        raw["perfmon"][0]["tasks"][0] = json!({
            "method": "readfile", "path": "relative.txt",
            "expect": "string", "timeout": 2.0
        });
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_submit_needs_destination() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("report");
        raw["submit"] = json!({"type": "http"});
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_execute_task_parses() {
        let mut raw = sample();
        raw["perfmon"][0]["tasks"][0] = json!({
            "method": "execute", "exec": "/bin/true", "params": ["-v"],
            "expect": "stringOrNull", "timeout": 3.0
        });
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        config.validate().unwrap();
        match &config.perfmon[0].tasks[0].method {
            MethodConfig::Execute { exec, params, .. } => {
                assert_eq!(exec, "/bin/true");
                assert_eq!(params, &["-v".to_string()]);
            }
            other => panic!("unexpected method {:?}", other),
        }
    }
}
