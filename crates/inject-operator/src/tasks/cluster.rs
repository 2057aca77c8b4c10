//! Cluster access used by the scope dispatcher and fault executors
//!
//! Everything that reads or mutates workload resources goes through
//! [`ClusterClient`], so resolution and executors can run against a mock.

use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Patch body and its content type
#[derive(Clone, Debug, PartialEq)]
pub enum ResourcePatch {
    Merge(Value),
    Strategic(Value),
}

/// Captured output of a command run inside a pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Trait abstracting Kubernetes operations on fault targets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods in a namespace, optionally filtered by labels
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// List nodes, optionally filtered by labels
    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    async fn patch_pod(&self, namespace: &str, name: &str, patch: ResourcePatch) -> Result<()>;

    async fn patch_node(&self, name: &str, patch: ResourcePatch) -> Result<()>;

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: ResourcePatch,
    ) -> Result<()>;

    /// Set replicas through the scale subresource
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a namespace; an existing one is accepted
    async fn create_namespace(&self, name: &str) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<()>;

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()>;

    /// Run a command in the pod's default container and collect its output
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// Real implementation backed by the API server
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn list_params(labels: &BTreeMap<String, String>) -> ListParams {
    if labels.is_empty() {
        return ListParams::default();
    }

    let selector = labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    ListParams::default().labels(&selector)
}

fn to_kube_patch(patch: &ResourcePatch) -> Patch<&Value> {
    match patch {
        ResourcePatch::Merge(body) => Patch::Merge(body),
        ResourcePatch::Strategic(body) => Patch::Strategic(body),
    }
}

async fn read_stream(stream: Option<impl AsyncRead + Unpin>) -> Result<String> {
    let Some(mut stream) = stream else {
        return Ok(String::new());
    };

    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::NetworkError(format!("read exec stream error: {e}")))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.list(&list_params(labels)).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&list_params(labels)).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.list(&list_params(labels)).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.get(name).await?)
    }

    #[instrument(skip(self, patch))]
    async fn patch_pod(&self, namespace: &str, name: &str, patch: ResourcePatch) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.patch(name, &PatchParams::default(), &to_kube_patch(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn patch_node(&self, name: &str, patch: ResourcePatch) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(name, &PatchParams::default(), &to_kube_patch(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: ResourcePatch,
    ) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments
            .patch(name, &PatchParams::default(), &to_kube_patch(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let body = json!({ "spec": { "replicas": replicas } });
        deployments
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(namespace = %name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.create(&PostParams::default(), &pod).await?;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.create(&PostParams::default(), &job).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods.exec(pod, command, &params).await?;
        let status = attached.take_status();
        let stdout_stream = attached.stdout();
        let stderr_stream = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout_stream), read_stream(stderr_stream));
        let mut output = ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
        };

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") && output.stderr.is_empty() {
                    output.stderr = status.message.unwrap_or_else(|| "command failed".to_string());
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| Error::NetworkError(format!("exec into {namespace}/{pod} error: {e}")))?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_joins_labels() {
        let labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        assert_eq!(
            list_params(&labels).label_selector.as_deref(),
            Some("app=web,tier=front")
        );
        assert_eq!(list_params(&BTreeMap::new()).label_selector, None);
    }

    #[test]
    fn test_patch_kind_mapping() {
        let merge = ResourcePatch::Merge(json!({"a": 1}));
        assert!(matches!(to_kube_patch(&merge), Patch::Merge(_)));
        let strategic = ResourcePatch::Strategic(json!({"a": 1}));
        assert!(matches!(to_kube_patch(&strategic), Patch::Strategic(_)));
    }
}
