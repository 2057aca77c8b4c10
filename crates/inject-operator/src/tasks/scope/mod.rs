//! Scope dispatcher: selector resolution and per-target actions
//!
//! Each scope resolves a declarative selector into concrete targets, re-resolves
//! a persisted stable name into a live target, and routes inject, recover,
//! query and liveness checks to the right executor.

use crate::crds::experiment::{ExperimentCommon, ExperimentSpec, PhaseType, ScopeType};
use crate::tasks::engine::Engine;
use crate::tasks::executor::{InjectCommand, SubExpInfo};
use crate::tasks::model::{AtomicObject, ContainerInfo};
use crate::tasks::types::{Error, Result};
use std::collections::HashSet;
use tracing::debug;

pub mod kubernetes;
pub mod node;
pub mod pod;

/// Keep the first target for each stable name, preserving order
#[must_use]
pub fn dedup_by_name(targets: Vec<AtomicObject>) -> Vec<AtomicObject> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(target.object_name()))
        .collect()
}

/// Resolve every selector unit and merge the results without duplicates
pub async fn resolve_selector(engine: &Engine, spec: &ExperimentSpec) -> Result<Vec<AtomicObject>> {
    let cluster = engine.cluster.as_ref();
    let targets = match spec.scope {
        ScopeType::Pod => {
            pod::resolve_selector(cluster, &spec.selector, &spec.experiment.args).await?
        }
        ScopeType::Node => {
            node::resolve_selector(cluster, &spec.selector, &spec.experiment.args).await?
        }
        ScopeType::Kubernetes => {
            kubernetes::resolve_selector(cluster, &spec.selector, &spec.experiment).await?
        }
    };

    let targets = dedup_by_name(targets);
    debug!(scope = %spec.scope, count = targets.len(), "Selector resolved");
    Ok(targets)
}

/// Turn a persisted stable name back into a live target
pub async fn resolve_target(
    engine: &Engine,
    scope: ScopeType,
    common: &ExperimentCommon,
    name: &str,
) -> Result<AtomicObject> {
    let cluster = engine.cluster.as_ref();
    match scope {
        ScopeType::Pod => pod::resolve_target(cluster, name).await,
        ScopeType::Node => node::resolve_target(cluster, name, &common.args).await,
        ScopeType::Kubernetes => kubernetes::resolve_target(cluster, name).await,
    }
}

fn host_of(target: &AtomicObject) -> Result<&str> {
    target.host_ip().ok_or_else(|| {
        Error::InvalidTarget(format!("{} has no host address", target.object_name()))
    })
}

fn inject_command(
    common: &ExperimentCommon,
    uid: &str,
    container: Option<&ContainerInfo>,
) -> InjectCommand {
    InjectCommand {
        target: common.target.clone(),
        fault: common.fault.clone(),
        uid: uid.to_string(),
        timeout: common.duration.clone(),
        container_id: container.map(|c| c.id.clone()).unwrap_or_default(),
        container_runtime: container.map(|c| c.runtime.clone()).unwrap_or_default(),
        args: common.args.clone(),
    }
}

/// Verify the executor serving the target is reachable
pub async fn check_alive(
    engine: &Engine,
    scope: ScopeType,
    common: &ExperimentCommon,
    target: &AtomicObject,
) -> Result<()> {
    match scope {
        ScopeType::Pod | ScopeType::Node => engine.remote.check_alive(host_of(target)?).await,
        ScopeType::Kubernetes => {
            if kubernetes::fault_of(common)?.needs_host() {
                engine.remote.check_alive(host_of(target)?).await
            } else {
                Ok(())
            }
        }
    }
}

/// Start the fault on one target and return its backup
pub async fn execute_inject(
    engine: &Engine,
    scope: ScopeType,
    common: &ExperimentCommon,
    target: &AtomicObject,
    uid: &str,
) -> Result<String> {
    match (scope, target) {
        (ScopeType::Pod, AtomicObject::Container(c)) => {
            if c.container.id.is_empty() || c.container.runtime.is_empty() {
                return Err(Error::InvalidTarget("container not provide".to_string()));
            }
            let command = inject_command(common, uid, Some(&c.container));
            engine.remote.inject(host_of(target)?, &command).await?;
            Ok(String::new())
        }
        (ScopeType::Node, AtomicObject::Node(n)) => {
            let command = inject_command(common, uid, n.container.as_ref());
            engine.remote.inject(host_of(target)?, &command).await?;
            Ok(String::new())
        }
        (ScopeType::Kubernetes, _) => {
            check_alive(engine, scope, common, target).await?;
            kubernetes::inject(engine, common, target, uid).await
        }
        (scope, target) => Err(Error::InvalidTarget(format!(
            "{} does not belong to scope {scope}",
            target.object_name()
        ))),
    }
}

/// Undo the fault on one target
pub async fn execute_recover(
    engine: &Engine,
    scope: ScopeType,
    common: &ExperimentCommon,
    target: &AtomicObject,
    uid: &str,
    backup: &str,
) -> Result<()> {
    match scope {
        ScopeType::Pod | ScopeType::Node => engine.remote.recover(host_of(target)?, uid).await,
        ScopeType::Kubernetes => kubernetes::recover(engine, common, target, uid, backup).await,
    }
}

/// Poll progress of the fault on one target
pub async fn execute_query(
    engine: &Engine,
    scope: ScopeType,
    common: &ExperimentCommon,
    target: &AtomicObject,
    uid: &str,
    backup: &str,
    phase: PhaseType,
) -> Result<SubExpInfo> {
    match scope {
        ScopeType::Pod | ScopeType::Node => {
            engine.remote.query(host_of(target)?, uid, phase).await
        }
        ScopeType::Kubernetes => kubernetes::query(engine, common, uid, backup, phase).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::experiment::ArgsUnit;
    use crate::tasks::cluster::MockClusterClient;
    use crate::tasks::executor::MockRemoteExecutor;
    use crate::tasks::model::{ContainerObject, DeploymentObject, NodeObject};
    use std::sync::Arc;

    fn common(target: &str, fault: &str) -> ExperimentCommon {
        ExperimentCommon {
            duration: "60s".to_string(),
            target: target.to_string(),
            fault: fault.to_string(),
            args: vec![ArgsUnit::new("percent", "80", "int")],
        }
    }

    fn container(id: &str) -> AtomicObject {
        AtomicObject::Container(ContainerObject {
            namespace: "default".to_string(),
            pod_name: "web-0".to_string(),
            node_ip: "10.0.0.5".to_string(),
            container: ContainerInfo {
                runtime: "containerd".to_string(),
                id: id.to_string(),
                name: "app".to_string(),
            },
            ..ContainerObject::default()
        })
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let deploy = |name: &str| {
            AtomicObject::Deployment(DeploymentObject {
                namespace: "default".to_string(),
                name: name.to_string(),
            })
        };
        let merged = dedup_by_name(vec![deploy("a"), deploy("b"), deploy("a")]);
        assert_eq!(merged, vec![deploy("a"), deploy("b")]);
    }

    #[tokio::test]
    async fn test_pod_inject_routes_to_node_host() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_inject()
            .withf(|host, command| {
                host == "10.0.0.5"
                    && command.target == "cpu"
                    && command.fault == "burn"
                    && command.timeout == "60s"
                    && command.container_id == "abc"
                    && command.uid == "u1"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = Engine::with_seed(Arc::new(MockClusterClient::new()), Arc::new(remote), 1, 0);

        let common = common("cpu", "burn");
        let backup = execute_inject(&engine, ScopeType::Pod, &common, &container("abc"), "u1")
            .await
            .unwrap();
        assert!(backup.is_empty());
    }

    #[tokio::test]
    async fn test_pod_inject_requires_container_id() {
        let engine = Engine::with_seed(
            Arc::new(MockClusterClient::new()),
            Arc::new(MockRemoteExecutor::new()),
            1,
            0,
        );
        let common = common("cpu", "burn");
        let err = execute_inject(&engine, ScopeType::Pod, &common, &container(""), "u1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid target: container not provide");
    }

    #[tokio::test]
    async fn test_node_query_and_check_alive_use_node_ip() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_check_alive()
            .withf(|host| host == "192.168.1.10")
            .times(1)
            .returning(|_| Ok(()));
        remote
            .expect_query()
            .withf(|host, uid, _| host == "192.168.1.10" && uid == "u1")
            .returning(|_, uid, _| {
                Ok(SubExpInfo {
                    uid: uid.to_string(),
                    ..SubExpInfo::default()
                })
            });
        let engine = Engine::with_seed(Arc::new(MockClusterClient::new()), Arc::new(remote), 1, 0);
        let target = AtomicObject::Node(NodeObject {
            node_name: "node-1".to_string(),
            node_ip: "192.168.1.10".to_string(),
            container: None,
        });
        let common = common("cpu", "burn");

        check_alive(&engine, ScopeType::Node, &common, &target).await.unwrap();
        let info = execute_query(
            &engine,
            ScopeType::Node,
            &common,
            &target,
            "u1",
            "",
            PhaseType::Inject,
        )
        .await
        .unwrap();
        assert_eq!(info.uid, "u1");
    }

    #[tokio::test]
    async fn test_container_pause_checks_host_before_inject() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_check_alive()
            .withf(|host| host == "10.0.0.5")
            .times(1)
            .returning(|_| Err(Error::RemoteError("expected version 0.5.1".to_string())));
        remote.expect_inject().never();
        let engine = Engine::with_seed(Arc::new(MockClusterClient::new()), Arc::new(remote), 1, 0);

        let common = common("pod", "containerpause");
        let err = execute_inject(&engine, ScopeType::Kubernetes, &common, &container("abc"), "u1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected version"));
    }

    #[tokio::test]
    async fn test_container_pause_injects_on_live_host() {
        let mut remote = MockRemoteExecutor::new();
        remote.expect_check_alive().times(1).returning(|_| Ok(()));
        remote
            .expect_inject()
            .withf(|host, command| {
                host == "10.0.0.5" && command.target == "container" && command.fault == "pause"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = Engine::with_seed(Arc::new(MockClusterClient::new()), Arc::new(remote), 1, 0);

        let common = common("pod", "containerpause");
        let target = container("abc");
        let backup = execute_inject(&engine, ScopeType::Kubernetes, &common, &target, "u1")
            .await
            .unwrap();
        assert_eq!(backup, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_scope_target_mismatch() {
        let engine = Engine::with_seed(
            Arc::new(MockClusterClient::new()),
            Arc::new(MockRemoteExecutor::new()),
            1,
            0,
        );
        let common = common("cpu", "burn");
        let err = execute_inject(&engine, ScopeType::Node, &common, &container("abc"), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }
}
