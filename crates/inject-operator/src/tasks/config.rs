//! Operator Configuration
//!
//! Loaded once at startup from a mounted YAML file. Covers the worker pool,
//! the auto-recovery sweep, controller concurrency and the remote executor backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main operator configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OperatorConfig {
    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Auto-recovery sweep configuration
    #[serde(default)]
    pub ticker: TickerConfig,

    /// Controller runtime configuration
    #[serde(default)]
    pub controller: ControllerRuntimeConfig,

    /// Remote executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Health server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Process-wide bound on concurrent per-target operations
    #[serde(default = "default_pool_count", rename = "poolCount")]
    pub pool_count: usize,
}

/// Auto-recovery sweep configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TickerConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_auto_check_interval", rename = "autoCheckInterval")]
    pub auto_check_interval: u64,
}

/// Controller runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerRuntimeConfig {
    /// Maximum number of experiments reconciled at once
    #[serde(
        default = "default_concurrent_reconciles",
        rename = "concurrentReconciles"
    )]
    pub concurrent_reconciles: u16,

    /// Requeue delay for experiments with work still in flight
    #[serde(default = "default_requeue_seconds", rename = "requeueSeconds")]
    pub requeue_seconds: u64,

    /// Requeue delay after a failed reconcile
    #[serde(
        default = "default_error_requeue_seconds",
        rename = "errorRequeueSeconds"
    )]
    pub error_requeue_seconds: u64,
}

/// Remote executor backend
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    #[default]
    Agent,
    Daemonset,
}

/// Remote executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutorMode,

    /// Name of the host-side executor binary
    #[serde(default = "default_executor_name")]
    pub executor: String,

    /// Version the host-side executor must report
    #[serde(default = "default_executor_version")]
    pub version: String,

    #[serde(default, rename = "agentConfig")]
    pub agent_config: AgentConfig,

    #[serde(default, rename = "daemonsetConfig")]
    pub daemonset_config: DaemonsetConfig,
}

/// HTTP agent backend settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_port", rename = "agentPort")]
    pub agent_port: u16,

    /// Per-request timeout in seconds
    #[serde(default = "default_agent_timeout", rename = "requestTimeoutSeconds")]
    pub request_timeout_seconds: u64,
}

/// Daemon-exec backend settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonsetConfig {
    /// Directory holding `<executor>-<version>/<executor>` on each host
    #[serde(default = "default_local_exec_path", rename = "localExecPath")]
    pub local_exec_path: String,

    #[serde(default = "default_daemon_namespace", rename = "daemonNs")]
    pub daemon_ns: String,

    #[serde(default = "default_daemon_label", rename = "daemonLabel")]
    pub daemon_label: BTreeMap<String, String>,
}

/// Health server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_pool_count() -> usize {
    5
}

fn default_auto_check_interval() -> u64 {
    10
}

fn default_concurrent_reconciles() -> u16 {
    10
}

fn default_requeue_seconds() -> u64 {
    3
}

fn default_error_requeue_seconds() -> u64 {
    15
}

fn default_executor_name() -> String {
    "chaosmetad".to_string()
}

fn default_executor_version() -> String {
    "0.5.1".to_string()
}

fn default_agent_port() -> u16 {
    29595
}

fn default_agent_timeout() -> u64 {
    30
}

fn default_local_exec_path() -> String {
    "/tmp".to_string()
}

fn default_daemon_namespace() -> String {
    "chaosmeta".to_string()
}

fn default_daemon_label() -> BTreeMap<String, String> {
    BTreeMap::from([("app.chaosmeta.io".to_string(), "chaosmeta-daemon".to_string())])
}

fn default_server_port() -> u16 {
    8081
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_count: default_pool_count(),
        }
    }
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            auto_check_interval: default_auto_check_interval(),
        }
    }
}

impl Default for ControllerRuntimeConfig {
    fn default() -> Self {
        Self {
            concurrent_reconciles: default_concurrent_reconciles(),
            requeue_seconds: default_requeue_seconds(),
            error_requeue_seconds: default_error_requeue_seconds(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutorMode::default(),
            executor: default_executor_name(),
            version: default_executor_version(),
            agent_config: AgentConfig::default(),
            daemonset_config: DaemonsetConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_port: default_agent_port(),
            request_timeout_seconds: default_agent_timeout(),
        }
    }
}

impl Default for DaemonsetConfig {
    fn default() -> Self {
        Self {
            local_exec_path: default_local_exec_path(),
            daemon_ns: default_daemon_namespace(),
            daemon_label: default_daemon_label(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

impl OperatorConfig {
    /// Validate that the configuration can drive a running operator.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.worker.pool_count == 0 {
            return Err(anyhow::anyhow!("worker.poolCount must be greater than 0"));
        }

        if self.ticker.auto_check_interval == 0 {
            return Err(anyhow::anyhow!(
                "ticker.autoCheckInterval must be greater than 0"
            ));
        }

        if self.controller.concurrent_reconciles == 0 {
            return Err(anyhow::anyhow!(
                "controller.concurrentReconciles must be greater than 0"
            ));
        }

        if self.executor.executor.is_empty() || self.executor.version.is_empty() {
            return Err(anyhow::anyhow!(
                "executor.executor and executor.version must both be set"
            ));
        }

        match self.executor.mode {
            ExecutorMode::Agent => {
                if self.executor.agent_config.agent_port == 0 {
                    return Err(anyhow::anyhow!(
                        "executor.agentConfig.agentPort must be set in agent mode"
                    ));
                }
            }
            ExecutorMode::Daemonset => {
                let daemonset = &self.executor.daemonset_config;
                if daemonset.daemon_ns.is_empty()
                    || daemonset.daemon_label.is_empty()
                    || daemonset.local_exec_path.is_empty()
                {
                    return Err(anyhow::anyhow!(
                        "executor.daemonsetConfig requires daemonNs, daemonLabel and localExecPath"
                    ));
                }
            }
        }

        Ok(())
    }

    /// Load configuration from mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: OperatorConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
