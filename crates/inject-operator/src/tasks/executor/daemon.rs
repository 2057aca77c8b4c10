//! Daemon-exec backend
//!
//! A privileged daemon pod runs on every node. Commands are executed inside it
//! through the exec subresource and enter the host namespaces with `nsenter`.

use super::{cli_flags, InjectCommand, QueryResponseData, RemoteExecutor, SubExpInfo, VersionInfo};
use crate::crds::experiment::PhaseType;
use crate::tasks::cluster::ClusterClient;
use crate::tasks::config::ExecutorConfig;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Quote one word for `bash -c`
fn shell_word(word: &str) -> Result<String> {
    shlex::try_quote(word).map(Cow::into_owned).map_err(|e| {
        Error::InvalidArgument(format!("value [{word}] cannot be passed to shell: {e}"))
    })
}

/// Remote executor running the host binary through a daemon pod
pub struct DaemonExecutor {
    cluster: Arc<dyn ClusterClient>,
    local_exec_path: String,
    executor: String,
    version: String,
    daemon_ns: String,
    daemon_label: BTreeMap<String, String>,
}

impl DaemonExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &ExecutorConfig) -> Self {
        Self {
            cluster,
            local_exec_path: config.daemonset_config.local_exec_path.clone(),
            executor: config.executor.clone(),
            version: config.version.clone(),
            daemon_ns: config.daemonset_config.daemon_ns.clone(),
            daemon_label: config.daemonset_config.daemon_label.clone(),
        }
    }

    fn executor_path(&self) -> String {
        format!(
            "{}/{}-{}/{}",
            self.local_exec_path, self.executor, self.version, self.executor
        )
    }

    /// `nsenter` line for the host binary, every word shell-quoted
    fn host_command<S: AsRef<str>>(&self, words: &[S]) -> Result<String> {
        let mut line = format!("nsenter -t 1 -m -u {}", shell_word(&self.executor_path())?);
        for word in words {
            line.push(' ');
            line.push_str(&shell_word(word.as_ref())?);
        }
        Ok(line)
    }

    fn inject_command(&self, command: &InjectCommand) -> Result<String> {
        let mut words = vec![
            "inject".to_string(),
            command.target.clone(),
            command.fault.clone(),
            "--uid".to_string(),
            command.uid.clone(),
        ];
        words.extend(cli_flags(&command.args));
        if !command.timeout.is_empty() {
            words.push("--timeout".to_string());
            words.push(command.timeout.clone());
        }
        if !command.container_runtime.is_empty() {
            words.push("--container-runtime".to_string());
            words.push(command.container_runtime.clone());
            words.push("--container-id".to_string());
            words.push(command.container_id.clone());
        }
        self.host_command(&words)
    }

    /// The single daemon pod scheduled on the node with the given IP
    async fn agent_pod(&self, host: &str) -> Result<Pod> {
        let mut pods: Vec<Pod> = self
            .cluster
            .list_pods(&self.daemon_ns, &self.daemon_label)
            .await?
            .into_iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|status| status.host_ip.as_deref())
                    == Some(host)
            })
            .collect();

        if pods.len() != 1 {
            return Err(Error::RemoteError(format!(
                "expected 1 agent pod on node[{host}], found {}",
                pods.len()
            )));
        }
        pods.pop()
            .ok_or_else(|| Error::NotFound(format!("agent pod on node[{host}]")))
    }

    async fn run(&self, host: &str, line: String) -> Result<String> {
        let pod = self.agent_pod(host).await?;
        let namespace = pod.namespace().unwrap_or_else(|| self.daemon_ns.clone());
        debug!(pod = %pod.name_any(), command = %line, "Executing in daemon pod");

        let output = self
            .cluster
            .exec_in_pod(
                &namespace,
                &pod.name_any(),
                vec!["/bin/bash".to_string(), "-c".to_string(), line],
            )
            .await?;

        if !output.stderr.trim().is_empty() {
            return Err(Error::RemoteError(format!(
                "exec error: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteExecutor for DaemonExecutor {
    #[instrument(skip(self))]
    async fn check_alive(&self, host: &str) -> Result<()> {
        let stdout = self.run(host, self.host_command(&["version"])?).await?;
        let info: VersionInfo = serde_json::from_str(&stdout).map_err(|e| {
            Error::RemoteError(format!("version output [{stdout}] is not json format: {e}"))
        })?;

        if info.version != self.version {
            return Err(Error::RemoteError(format!(
                "expected version {}, but get {}",
                self.version, info.version
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, command), fields(uid = %command.uid))]
    async fn inject(&self, host: &str, command: &InjectCommand) -> Result<()> {
        self.run(host, self.inject_command(command)?).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover(&self, host: &str, uid: &str) -> Result<()> {
        self.run(host, self.host_command(&["recover", uid])?).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, host: &str, uid: &str, phase: PhaseType) -> Result<SubExpInfo> {
        let stdout = self
            .run(host, self.host_command(&["query", "-u", uid, "--format", "json"])?)
            .await?;
        let data: QueryResponseData = serde_json::from_str(&stdout).map_err(|e| {
            Error::RemoteError(format!("query output [{stdout}] is not json format: {e}"))
        })?;

        if data.total == 0 {
            return Err(Error::NotFound(format!("task {uid}")));
        }
        if data.total != 1 || data.experiments.len() != 1 {
            return Err(Error::RemoteError(format!(
                "query output expect 1 but get: {}",
                data.total
            )));
        }

        data.experiments
            .into_iter()
            .next()
            .map(|task| task.into_sub_exp(uid, phase))
            .ok_or_else(|| Error::NotFound(format!("task {uid}")))
    }
}
