//! Pod-level structural faults: labels, container image and container pause

use super::labels::{labels_patch, new_labels, restore_labels};
use crate::crds::experiment::ArgsUnit;
use crate::tasks::cluster::{ClusterClient, ResourcePatch};
use crate::tasks::common::get_arg;
use crate::tasks::executor::{InjectCommand, RemoteExecutor};
use crate::tasks::model::ContainerObject;
use crate::tasks::types::{Error, Result};
use serde_json::json;

const PAUSE_TARGET: &str = "container";
const PAUSE_FAULT: &str = "pause";

pub async fn inject_label(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let pod = cluster.get_pod(namespace, name).await?;
    let old = pod.metadata.labels.unwrap_or_default();
    let labels = new_labels(
        &old,
        get_arg(args, "add").unwrap_or_default(),
        get_arg(args, "delete").unwrap_or_default(),
    )?;

    cluster
        .patch_pod(namespace, name, ResourcePatch::Merge(labels_patch(labels)))
        .await?;
    Ok(serde_json::to_string(&old)?)
}

pub async fn recover_label(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    backup: &str,
) -> Result<()> {
    let pod = cluster.get_pod(namespace, name).await?;
    let labels = restore_labels(backup, &pod.metadata.labels.unwrap_or_default())?;
    cluster
        .patch_pod(namespace, name, ResourcePatch::Merge(labels_patch(labels)))
        .await
}

fn image_patch(container: &str, image: &str) -> ResourcePatch {
    ResourcePatch::Strategic(json!({
        "spec": { "containers": [{ "name": container, "image": image }] }
    }))
}

/// Swap the container's image; the backup is the image it had before
pub async fn inject_container_image(
    cluster: &dyn ClusterClient,
    target: &ContainerObject,
    args: &[ArgsUnit],
) -> Result<String> {
    let image = get_arg(args, "image")
        .filter(|image| !image.is_empty())
        .ok_or_else(|| Error::InvalidArgument("args \"image\" is empty".to_string()))?;

    let pod = cluster.get_pod(&target.namespace, &target.pod_name).await?;
    let old_image = pod
        .spec
        .as_ref()
        .and_then(|spec| {
            spec.containers
                .iter()
                .find(|c| c.name == target.container.name)
        })
        .map(|c| c.image.clone().unwrap_or_default())
        .ok_or_else(|| {
            Error::NotFound(format!(
                "container[{}] in pod[{}/{}]",
                target.container.name, target.namespace, target.pod_name
            ))
        })?;

    cluster
        .patch_pod(
            &target.namespace,
            &target.pod_name,
            image_patch(&target.container.name, image),
        )
        .await?;
    Ok(old_image)
}

pub async fn recover_container_image(
    cluster: &dyn ClusterClient,
    target: &ContainerObject,
    backup: &str,
) -> Result<()> {
    if backup.is_empty() {
        return Err(Error::InvalidArgument(
            "backup image is empty, nothing to restore".to_string(),
        ));
    }

    cluster
        .patch_pod(
            &target.namespace,
            &target.pod_name,
            image_patch(&target.container.name, backup),
        )
        .await
}

/// Pause runs on the host, so it goes through the remote executor.
/// The backup is the host address later used by recover and query.
pub async fn inject_container_pause(
    remote: &dyn RemoteExecutor,
    target: &ContainerObject,
    uid: &str,
    timeout: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    if target.node_ip.is_empty() {
        return Err(Error::InvalidTarget(format!(
            "pod[{}/{}] has no host ip",
            target.namespace, target.pod_name
        )));
    }

    let command = InjectCommand {
        target: PAUSE_TARGET.to_string(),
        fault: PAUSE_FAULT.to_string(),
        uid: uid.to_string(),
        timeout: timeout.to_string(),
        container_id: target.container.id.clone(),
        container_runtime: target.container.runtime.clone(),
        args: args.to_vec(),
    };
    remote.inject(&target.node_ip, &command).await?;
    Ok(target.node_ip.clone())
}
