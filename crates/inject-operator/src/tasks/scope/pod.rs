//! Pod scope: one target per matched container of every matched pod

use crate::crds::experiment::{ArgsUnit, SelectorUnit, CONTAINER_KEY, FIRST_CONTAINER};
use crate::tasks::cluster::ClusterClient;
use crate::tasks::common::get_arg;
use crate::tasks::model::{
    parse_container_id, AtomicObject, ContainerInfo, ContainerObject, PodObject, TargetName,
};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

fn container_info(status: &ContainerStatus) -> Result<ContainerInfo> {
    let raw = status.container_id.as_deref().unwrap_or_default();
    let (runtime, id) = parse_container_id(raw).map_err(|e| {
        Error::InvalidTarget(format!("parse container id[{raw}] error: {e}"))
    })?;
    Ok(ContainerInfo {
        runtime,
        id,
        name: status.name.clone(),
    })
}

/// Containers selected by `filter`.
///
/// Empty or `firstcontainer` picks the first reported container; anything else
/// is a comma-joined list of name patterns matched against the whole name.
pub fn target_containers(filter: &str, statuses: &[ContainerStatus]) -> Result<Vec<ContainerInfo>> {
    if statuses.is_empty() {
        return Err(Error::InvalidTarget("no container in pod".to_string()));
    }

    if filter.is_empty() || filter == FIRST_CONTAINER {
        return Ok(vec![container_info(&statuses[0])?]);
    }

    let pattern = format!("^({})$", filter.replace(',', "|"));
    let reg = Regex::new(&pattern)
        .map_err(|e| Error::InvalidArgument(format!("container pattern[{filter}] error: {e}")))?;
    statuses
        .iter()
        .filter(|status| reg.is_match(&status.name))
        .map(container_info)
        .collect()
}

fn pod_object(pod: &Pod, filter: &str) -> Result<PodObject> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let status = pod.status.clone().unwrap_or_default();
    let statuses = status.container_statuses.unwrap_or_default();
    let containers = target_containers(filter, &statuses).map_err(|e| {
        Error::InvalidTarget(format!(
            "get target container[{filter}] in pod[{name}] error: {e}"
        ))
    })?;

    Ok(PodObject {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        pod_name: name,
        pod_uid: pod.metadata.uid.clone().unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default(),
        node_ip: status.host_ip.unwrap_or_default(),
        containers,
    })
}

/// Pods of one selector unit: the name list wins over the label map
pub async fn list_unit_pods(cluster: &dyn ClusterClient, unit: &SelectorUnit) -> Result<Vec<Pod>> {
    if unit.name.is_empty() {
        return cluster.list_pods(&unit.namespace, &unit.label).await;
    }

    let names: HashSet<&str> = unit.name.iter().map(String::as_str).collect();
    let pods = cluster.list_pods(&unit.namespace, &BTreeMap::new()).await?;
    Ok(pods
        .into_iter()
        .filter(|pod| {
            pod.metadata
                .name
                .as_deref()
                .is_some_and(|name| names.contains(name))
        })
        .collect())
}

pub async fn resolve_selector(
    cluster: &dyn ClusterClient,
    selectors: &[SelectorUnit],
    args: &[ArgsUnit],
) -> Result<Vec<AtomicObject>> {
    let filter = get_arg(args, CONTAINER_KEY).unwrap_or_default();
    let mut targets = Vec::new();

    for unit in selectors {
        if unit.namespace.is_empty() {
            return Err(Error::InvalidArgument(
                "selector of scope pod must provide namespace".to_string(),
            ));
        }

        for pod in list_unit_pods(cluster, unit).await? {
            let object = pod_object(&pod, filter)?;
            targets.extend(object.sub_objects().into_iter().map(AtomicObject::Container));
        }
    }
    Ok(targets)
}

/// Live container target for `pod/<ns>/<name>/<container>`
pub async fn resolve_container(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    container: &str,
) -> Result<ContainerObject> {
    let pod = cluster.get_pod(namespace, name).await?;
    let status = pod.status.clone().unwrap_or_default();
    let matched = status
        .container_statuses
        .unwrap_or_default()
        .iter()
        .find(|c| c.name == container)
        .map(container_info)
        .transpose()?
        .ok_or_else(|| {
            Error::NotFound(format!("container[{container}] in pod[{namespace}/{name}]"))
        })?;

    Ok(ContainerObject {
        namespace: namespace.to_string(),
        pod_name: name.to_string(),
        pod_uid: pod.metadata.uid.clone().unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default(),
        node_ip: status.host_ip.unwrap_or_default(),
        container: matched,
    })
}

/// Pod target without container resolution, for faults on the pod itself
#[must_use]
pub fn bare_pod_object(pod: Pod) -> PodObject {
    let status = pod.status.unwrap_or_default();
    PodObject {
        namespace: pod.metadata.namespace.unwrap_or_default(),
        pod_name: pod.metadata.name.unwrap_or_default(),
        pod_uid: pod.metadata.uid.unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        node_name: pod.spec.and_then(|spec| spec.node_name).unwrap_or_default(),
        node_ip: status.host_ip.unwrap_or_default(),
        containers: Vec::new(),
    }
}

pub async fn resolve_target(cluster: &dyn ClusterClient, name: &str) -> Result<AtomicObject> {
    match name.parse::<TargetName>()? {
        TargetName::Pod {
            namespace,
            name,
            container: Some(container),
        } => Ok(AtomicObject::Container(
            resolve_container(cluster, &namespace, &name, &container).await?,
        )),
        _ => Err(Error::InvalidTarget(format!(
            "unexpected pod object name: {name}"
        ))),
    }
}
