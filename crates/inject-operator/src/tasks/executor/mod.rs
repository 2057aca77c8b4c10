//! Remote executor contract for host-level faults
//!
//! Two backends satisfy [`RemoteExecutor`]: an HTTP agent listening on every
//! host ([`agent::AgentExecutor`]) and a privileged daemon pod reached through
//! the exec subresource ([`daemon::DaemonExecutor`]). Both report progress in
//! the agent's own four-valued status which [`convert_status`] maps onto
//! sub-task status per phase.

use crate::crds::experiment::{ArgsUnit, PhaseType, StatusType, ValueType, CONTAINER_KEY};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

#[cfg(test)]
use mockall::automock;

pub mod agent;
pub mod daemon;

pub use agent::AgentExecutor;
pub use daemon::DaemonExecutor;

/// Creator recorded by the host-side executor for every experiment we start
pub const CREATOR: &str = "chaosmeta-inject-operator";

/// Progress of one remote experiment as observed by the caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubExpInfo {
    pub uid: String,
    pub status: StatusType,
    pub message: String,
    pub create_time: String,
    pub update_time: String,
}

/// Everything a host needs to start one fault
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectCommand {
    pub target: String,
    pub fault: String,
    pub uid: String,
    pub timeout: String,
    pub container_id: String,
    pub container_runtime: String,
    pub args: Vec<ArgsUnit>,
}

/// Backend-agnostic inject/recover/query against a host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Verify the host executor is reachable and runs the expected version
    async fn check_alive(&self, host: &str) -> Result<()>;

    async fn inject(&self, host: &str, command: &InjectCommand) -> Result<()>;

    async fn recover(&self, host: &str, uid: &str) -> Result<()>;

    async fn query(&self, host: &str, uid: &str, phase: PhaseType) -> Result<SubExpInfo>;
}

/// Status reported by the host-side executor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteStatus {
    Created,
    Success,
    Error,
    Destroyed,
    Unknown(String),
}

impl From<&str> for RemoteStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "created" => RemoteStatus::Created,
            "success" => RemoteStatus::Success,
            "error" => RemoteStatus::Error,
            "destroyed" => RemoteStatus::Destroyed,
            other => RemoteStatus::Unknown(other.to_string()),
        }
    }
}

/// Map a remote status onto sub-task status.
///
/// During recover `error` means there was nothing left to undo.
#[must_use]
pub fn convert_status(status: &RemoteStatus, phase: PhaseType) -> StatusType {
    match (phase, status) {
        (PhaseType::Inject, RemoteStatus::Created) => StatusType::Running,
        (PhaseType::Inject, RemoteStatus::Success | RemoteStatus::Destroyed) => {
            StatusType::Success
        }
        (PhaseType::Recover, RemoteStatus::Error | RemoteStatus::Destroyed) => {
            StatusType::Success
        }
        _ => StatusType::Failed,
    }
}

/// One experiment record as reported by the host-side executor
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExperimentDataUnit {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub fault: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub container_runtime: String,
}

impl ExperimentDataUnit {
    #[must_use]
    pub fn into_sub_exp(self, uid: &str, phase: PhaseType) -> SubExpInfo {
        SubExpInfo {
            uid: uid.to_string(),
            status: convert_status(&RemoteStatus::from(self.status.as_str()), phase),
            message: self.error,
            create_time: self.create_time,
            update_time: self.update_time,
        }
    }
}

/// Result page of a query
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryResponseData {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub experiments: Vec<ExperimentDataUnit>,
}

/// Version report of the host-side executor
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "build-date")]
    pub build_date: String,
}

/// Fault arguments as the agent expects them: `-` becomes `_` in keys and
/// int-typed values are sent as numbers.
pub fn agent_args(args: &[ArgsUnit]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for unit in args.iter().filter(|unit| unit.key != CONTAINER_KEY) {
        let key = unit.key.replace('-', "_");
        let value_type: ValueType = unit.value_type.parse().map_err(|e| {
            Error::InvalidArgument(format!("args[{key}] {e}"))
        })?;

        let value = match value_type {
            ValueType::Int => {
                let number: i64 = unit.value.parse().map_err(|_| {
                    Error::InvalidArgument(format!(
                        "args[{key}]'s value[{}] require int type",
                        unit.value
                    ))
                })?;
                Value::from(number)
            }
            ValueType::String => Value::from(unit.value.clone()),
        };
        map.insert(key, value);
    }
    Ok(map)
}

/// Fault arguments as command-line flags: `_` becomes `-` in keys.
#[must_use]
pub fn cli_flags(args: &[ArgsUnit]) -> Vec<String> {
    args.iter()
        .filter(|unit| unit.key != CONTAINER_KEY)
        .map(|unit| format!("--{}={}", unit.key.replace('_', "-"), unit.value))
        .collect()
}

/// Fresh trace id attached to every agent request
#[must_use]
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
