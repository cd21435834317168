//! Result envelopes carried from task runs to sinks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expect::Expect;

/// Collection-time context shared by the tasks of one job run.
///
/// Holds the run's `datetime` stamp, method extras such as `_returncode`
/// and `_stderr`, and the nested `_step` map of per-task sub-results.
pub type Params = Map<String, Value>;

/// Outcome tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    Result,
    Error,
}

/// One batched unit of delivery: the outcome of a single job run.
///
/// Immutable once pushed to the submit queue; `submit_time` is the only
/// field stamped later, by the first buffered submitter that sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub cmd: Cmd,
    pub name: String,
    pub params: Params,
    pub expect: Expect,
    pub value: Value,
    pub errno: u8,
    #[serde(default)]
    pub error: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<String>,
}

impl ResultEnvelope {
    pub fn is_error(&self) -> bool {
        self.cmd == Cmd::Error
    }
}
