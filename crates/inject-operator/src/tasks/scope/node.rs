//! Node scope: targets are nodes addressed by their internal IP

use crate::crds::experiment::{ArgsUnit, SelectorUnit, CONTAINER_KEY};
use crate::tasks::cluster::ClusterClient;
use crate::tasks::common::get_arg;
use crate::tasks::model::{parse_container_id, AtomicObject, ContainerInfo, NodeObject, TargetName};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

const INTERNAL_IP: &str = "InternalIP";

#[must_use]
pub fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == INTERNAL_IP)
        .map(|address| address.address.clone())
}

/// Container to attach to node targets, from the optional `containername` arg
fn attached_container(args: &[ArgsUnit]) -> Result<Option<ContainerInfo>> {
    match get_arg(args, CONTAINER_KEY).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => {
            let (runtime, id) = parse_container_id(raw).map_err(|e| {
                Error::InvalidArgument(format!("parse container info error: {e}"))
            })?;
            Ok(Some(ContainerInfo {
                runtime,
                id,
                name: String::new(),
            }))
        }
    }
}

fn node_object(node: &Node, container: Option<&ContainerInfo>) -> NodeObject {
    NodeObject {
        node_name: node.metadata.name.clone().unwrap_or_default(),
        node_ip: internal_ip(node).unwrap_or_default(),
        container: container.cloned(),
    }
}

/// Nodes of one selector unit, by IP list, then name list, then label
pub async fn list_unit_nodes(
    cluster: &dyn ClusterClient,
    unit: &SelectorUnit,
) -> Result<Vec<Node>> {
    if !unit.ip.is_empty() {
        let ips: HashSet<&str> = unit.ip.iter().map(String::as_str).collect();
        let nodes = cluster.list_nodes(&BTreeMap::new()).await?;
        return Ok(nodes
            .into_iter()
            .filter(|node| internal_ip(node).is_some_and(|ip| ips.contains(ip.as_str())))
            .collect());
    }

    if !unit.name.is_empty() {
        let names: HashSet<&str> = unit.name.iter().map(String::as_str).collect();
        let nodes = cluster.list_nodes(&BTreeMap::new()).await?;
        return Ok(nodes
            .into_iter()
            .filter(|node| {
                node.metadata
                    .name
                    .as_deref()
                    .is_some_and(|name| names.contains(name))
            })
            .collect());
    }

    cluster.list_nodes(&unit.label).await
}

pub async fn resolve_selector(
    cluster: &dyn ClusterClient,
    selectors: &[SelectorUnit],
    args: &[ArgsUnit],
) -> Result<Vec<AtomicObject>> {
    let container = attached_container(args)?;
    let mut targets = Vec::new();
    for unit in selectors {
        for node in list_unit_nodes(cluster, unit).await? {
            let object = node_object(&node, container.as_ref());
            if object.node_ip.is_empty() {
                warn!(node = %object.node_name, "Node has no InternalIP address, skipping");
                continue;
            }
            targets.push(AtomicObject::Node(object));
        }
    }
    Ok(targets)
}

/// Live node for `node/<name>/<ip>`; the stored IP is only used as a fallback
pub async fn resolve_node(cluster: &dyn ClusterClient, name: &str, ip: &str) -> Result<NodeObject> {
    let node = cluster.get_node(name).await?;
    let mut object = node_object(&node, None);
    if object.node_ip.is_empty() {
        object.node_ip = ip.to_string();
    }
    Ok(object)
}

pub async fn resolve_target(
    cluster: &dyn ClusterClient,
    name: &str,
    args: &[ArgsUnit],
) -> Result<AtomicObject> {
    match name.parse::<TargetName>()? {
        TargetName::Node { name, ip } => {
            let mut node = resolve_node(cluster, &name, &ip).await?;
            node.container = attached_container(args)?;
            Ok(AtomicObject::Node(node))
        }
        _ => Err(Error::InvalidTarget(format!(
            "unexpected node object name: {name}"
        ))),
    }
}
