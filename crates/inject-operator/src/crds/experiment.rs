//! `Experiment` Custom Resource Definition for fault injection

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Finalizer that keeps an experiment alive until its faults are recovered
pub const FINALIZER_NAME: &str = "chaosmeta/experiment";

/// Argument key selecting which containers of a pod receive the fault
pub const CONTAINER_KEY: &str = "containername";

/// Container filter value meaning "the first container of the pod"
pub const FIRST_CONTAINER: &str = "firstcontainer";

/// Separator for list-valued arguments (`a,b,c`)
pub const ARGS_LIST_SPLIT: char = ',';

/// Separator for `key=value` pairs inside list-valued arguments
pub const LABEL_LIST_SPLIT: char = '=';

/// Selector semantics used to resolve targets
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Pod,
    Node,
    Kubernetes,
}

impl ScopeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeType::Pod => "pod",
            ScopeType::Node => "node",
            ScopeType::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Experiment phase; advances inject -> recover and never back
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    #[default]
    Inject,
    Recover,
}

impl PhaseType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseType::Inject => "inject",
            PhaseType::Recover => "recover",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a phase, or the status of a single sub-task
///
/// `PartSuccess` only appears at the aggregate level.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StatusType {
    #[default]
    Created,
    Running,
    Success,
    Failed,
    PartSuccess,
}

impl StatusType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StatusType::Created => "created",
            StatusType::Running => "running",
            StatusType::Success => "success",
            StatusType::Failed => "failed",
            StatusType::PartSuccess => "partSuccess",
        }
    }

    /// Whether no further work will happen in the current phase
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusType::Success | StatusType::Failed | StatusType::PartSuccess
        )
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-selection filter limiting how many targets receive the fault
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RangeType {
    All,
    Percent,
    Count,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub struct RangeMode {
    #[serde(rename = "type")]
    pub range_type: RangeType,

    #[serde(default)]
    pub value: i64,
}

/// Declared type of an argument value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Int,
    String,
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(ValueType::Int),
            "string" => Ok(ValueType::String),
            other => Err(format!("not support value type: {other}")),
        }
    }
}

/// Resource kinds addressable by the kubernetes scope
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CloudTargetType {
    Cluster,
    Pod,
    Node,
    Deployment,
    Namespace,
    Job,
}

impl CloudTargetType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloudTargetType::Cluster => "cluster",
            CloudTargetType::Pod => "pod",
            CloudTargetType::Node => "node",
            CloudTargetType::Deployment => "deployment",
            CloudTargetType::Namespace => "namespace",
            CloudTargetType::Job => "job",
        }
    }
}

impl FromStr for CloudTargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(CloudTargetType::Cluster),
            "pod" => Ok(CloudTargetType::Pod),
            "node" => Ok(CloudTargetType::Node),
            "deployment" => Ok(CloudTargetType::Deployment),
            "namespace" => Ok(CloudTargetType::Namespace),
            "job" => Ok(CloudTargetType::Job),
            other => Err(format!("not support target type: {other}")),
        }
    }
}

impl fmt::Display for CloudTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key-typed fault argument
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ArgsUnit {
    pub key: String,

    pub value: String,

    /// `int` or `string`
    #[serde(default, rename = "valueType")]
    pub value_type: String,
}

impl ArgsUnit {
    pub fn new(key: impl Into<String>, value: impl Into<String>, value_type: &str) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type: value_type.to_string(),
        }
    }
}

/// Fault descriptor
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExperimentCommon {
    /// `<int>[h|m|s]`, a bare integer means seconds; empty means no timeout
    #[serde(default)]
    pub duration: String,

    /// Fault target kind (e.g. `cpu`, `network`, `pod`, `deployment`)
    pub target: String,

    /// Fault name within the target kind
    pub fault: String,

    #[serde(default)]
    pub args: Vec<ArgsUnit>,
}

/// One selector clause; constraints inside a unit are ANDed, units are ORed
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SelectorUnit {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: Vec<String>,

    #[serde(default)]
    pub ip: Vec<String>,

    #[serde(default)]
    pub label: BTreeMap<String, String>,

    #[serde(default, rename = "subName")]
    pub sub_name: String,
}

/// `Experiment` CRD describing a fault injection against selected targets
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "inject.chaosmeta.io", version = "v1alpha1", kind = "Experiment")]
#[kube(namespaced)]
#[kube(status = "ExperimentStatus")]
#[kube(printcolumn = r#"{"name":"Scope","type":"string","jsonPath":".spec.scope"}"#)]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.experiment.target"}"#)]
#[kube(printcolumn = r#"{"name":"Fault","type":"string","jsonPath":".spec.experiment.fault"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ExperimentSpec {
    pub scope: ScopeType,

    #[serde(default, rename = "rangeMode", skip_serializing_if = "Option::is_none")]
    pub range_mode: Option<RangeMode>,

    pub experiment: ExperimentCommon,

    #[serde(default)]
    pub selector: Vec<SelectorUnit>,

    /// The only field users may change after creation (inject -> recover)
    #[serde(default, rename = "targetPhase")]
    pub target_phase: PhaseType,
}

/// Progress record of one target within a phase
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExperimentDetailUnit {
    #[serde(rename = "injectObjectName")]
    pub inject_object_name: String,

    pub uid: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: StatusType,

    #[serde(default, rename = "startTime")]
    pub start_time: String,

    #[serde(default, rename = "updateTime")]
    pub update_time: String,

    /// Pre-mutation snapshot consumed by recover
    #[serde(default)]
    pub backup: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExperimentDetail {
    #[serde(default)]
    pub inject: Vec<ExperimentDetailUnit>,

    #[serde(default)]
    pub recover: Vec<ExperimentDetailUnit>,
}

impl ExperimentDetail {
    /// Sub-task list owned by the given phase
    pub fn units_mut(&mut self, phase: PhaseType) -> &mut Vec<ExperimentDetailUnit> {
        match phase {
            PhaseType::Inject => &mut self.inject,
            PhaseType::Recover => &mut self.recover,
        }
    }

    #[must_use]
    pub fn units(&self, phase: PhaseType) -> &[ExperimentDetailUnit] {
        match phase {
            PhaseType::Inject => &self.inject,
            PhaseType::Recover => &self.recover,
        }
    }
}

/// Status of the `Experiment`, fully owned by the operator
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExperimentStatus {
    /// Absent until the sub-tasks have been seeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseType>,

    #[serde(default)]
    pub status: StatusType,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub detail: ExperimentDetail,

    #[serde(default, rename = "createTime")]
    pub create_time: String,

    #[serde(default, rename = "updateTime")]
    pub update_time: String,
}
