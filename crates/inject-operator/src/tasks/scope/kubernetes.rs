//! Kubernetes scope: structural faults routed by the fault's target kind

use super::{node, pod};
use crate::crds::experiment::{CloudTargetType, ExperimentCommon, PhaseType, SelectorUnit};
use crate::tasks::cluster::ClusterClient;
use crate::tasks::common::get_arg;
use crate::tasks::engine::Engine;
use crate::tasks::executor::SubExpInfo;
use crate::tasks::model::{AtomicObject, DeploymentObject, NamespaceObject, TargetName};
use crate::tasks::native::{self, Granularity, NativeFault};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::{BTreeMap, HashSet};

const NAMESPACE_ARG: &str = "namespace";

pub fn fault_of(common: &ExperimentCommon) -> Result<NativeFault> {
    let target: CloudTargetType = common.target.parse().map_err(Error::InvalidArgument)?;
    NativeFault::resolve(target, &common.fault)
}

fn require_namespace(unit: &SelectorUnit, kind: &str) -> Result<()> {
    if unit.namespace.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "selector of {kind} must provide namespace"
        )));
    }
    Ok(())
}

async fn list_unit_deployments(
    cluster: &dyn ClusterClient,
    unit: &SelectorUnit,
) -> Result<Vec<Deployment>> {
    if unit.name.is_empty() {
        return cluster.list_deployments(&unit.namespace, &unit.label).await;
    }

    let names: HashSet<&str> = unit.name.iter().map(String::as_str).collect();
    let deployments = cluster
        .list_deployments(&unit.namespace, &BTreeMap::new())
        .await?;
    Ok(deployments
        .into_iter()
        .filter(|d| {
            d.metadata
                .name
                .as_deref()
                .is_some_and(|name| names.contains(name))
        })
        .collect())
}

pub async fn resolve_selector(
    cluster: &dyn ClusterClient,
    selectors: &[SelectorUnit],
    common: &ExperimentCommon,
) -> Result<Vec<AtomicObject>> {
    let fault = fault_of(common)?;
    let mut targets = Vec::new();

    match fault.granularity() {
        Granularity::Container => {
            return pod::resolve_selector(cluster, selectors, &common.args).await;
        }
        Granularity::Node => return node::resolve_selector(cluster, selectors, &[]).await,
        Granularity::Pod => {
            for unit in selectors {
                require_namespace(unit, "pod")?;
                for found in pod::list_unit_pods(cluster, unit).await? {
                    targets.push(AtomicObject::Pod(pod::bare_pod_object(found)));
                }
            }
        }
        Granularity::Deployment => {
            for unit in selectors {
                require_namespace(unit, "deployment")?;
                for found in list_unit_deployments(cluster, unit).await? {
                    targets.push(AtomicObject::Deployment(DeploymentObject {
                        namespace: found
                            .metadata
                            .namespace
                            .unwrap_or_else(|| unit.namespace.clone()),
                        name: found.metadata.name.unwrap_or_default(),
                    }));
                }
            }
        }
        Granularity::Namespace => {
            let namespace = get_arg(&common.args, NAMESPACE_ARG)
                .filter(|ns| !ns.is_empty())
                .ok_or_else(|| {
                    Error::InvalidArgument("args \"namespace\" is empty".to_string())
                })?;
            targets.push(AtomicObject::Namespace(NamespaceObject {
                namespace: namespace.to_string(),
            }));
        }
    }
    Ok(targets)
}

pub async fn resolve_target(cluster: &dyn ClusterClient, name: &str) -> Result<AtomicObject> {
    let target = match name.parse::<TargetName>()? {
        TargetName::Pod {
            namespace,
            name,
            container: Some(container),
        } => AtomicObject::Container(
            pod::resolve_container(cluster, &namespace, &name, &container).await?,
        ),
        TargetName::Pod {
            namespace,
            name,
            container: None,
        } => AtomicObject::Pod(pod::bare_pod_object(
            cluster.get_pod(&namespace, &name).await?,
        )),
        TargetName::Node { name, ip } => {
            AtomicObject::Node(node::resolve_node(cluster, &name, &ip).await?)
        }
        TargetName::Deployment { namespace, name } => {
            cluster.get_deployment(&namespace, &name).await?;
            AtomicObject::Deployment(DeploymentObject { namespace, name })
        }
        TargetName::Namespace { name } => {
            AtomicObject::Namespace(NamespaceObject { namespace: name })
        }
    };
    Ok(target)
}

pub async fn inject(
    engine: &Engine,
    common: &ExperimentCommon,
    target: &AtomicObject,
    uid: &str,
) -> Result<String> {
    native::inject(engine, fault_of(common)?, target, uid, &common.duration, &common.args).await
}

pub async fn recover(
    engine: &Engine,
    common: &ExperimentCommon,
    target: &AtomicObject,
    uid: &str,
    backup: &str,
) -> Result<()> {
    native::recover(engine, fault_of(common)?, target, uid, backup).await
}

pub async fn query(
    engine: &Engine,
    common: &ExperimentCommon,
    uid: &str,
    backup: &str,
    phase: PhaseType,
) -> Result<SubExpInfo> {
    native::query(engine, fault_of(common)?, uid, backup, phase).await
}
