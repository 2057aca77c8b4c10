//! Direct-API executor family for structural faults
//!
//! These faults mutate cluster resources through the API server instead of
//! running anything on a host. Inject returns the pre-mutation value as the
//! sub-task backup and recover applies it back.

use crate::crds::experiment::{ArgsUnit, CloudTargetType, PhaseType, StatusType};
use crate::tasks::common::now_string;
use crate::tasks::engine::Engine;
use crate::tasks::executor::SubExpInfo;
use crate::tasks::model::AtomicObject;
use crate::tasks::types::{Error, Result};
use tracing::{debug, info};

pub mod bulk;
pub mod deployment;
pub mod labels;
pub mod node;
pub mod pod;

/// Every structural fault the operator knows how to apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeFault {
    PodLabel,
    PodDelete,
    PodContainerImage,
    PodContainerPause,
    NodeLabel,
    NodeTaint,
    DeploymentReplicas,
    DeploymentDelete,
    DeploymentFinalizer,
    ClusterPendingPod,
    ClusterCompletedJob,
}

/// Kind of live object a fault operates on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Pod,
    Container,
    Node,
    Deployment,
    Namespace,
}

impl NativeFault {
    pub fn resolve(target: CloudTargetType, fault: &str) -> Result<Self> {
        let resolved = match (target, fault) {
            (CloudTargetType::Pod, "label") => NativeFault::PodLabel,
            (CloudTargetType::Pod, "delete") => NativeFault::PodDelete,
            (CloudTargetType::Pod, "containerimage") => NativeFault::PodContainerImage,
            (CloudTargetType::Pod, "containerpause") => NativeFault::PodContainerPause,
            (CloudTargetType::Node, "label") => NativeFault::NodeLabel,
            (CloudTargetType::Node, "taint") => NativeFault::NodeTaint,
            (CloudTargetType::Deployment, "replicas") => NativeFault::DeploymentReplicas,
            (CloudTargetType::Deployment, "delete") => NativeFault::DeploymentDelete,
            (CloudTargetType::Deployment, "finalizer") => NativeFault::DeploymentFinalizer,
            (CloudTargetType::Cluster, "pendingpod") => NativeFault::ClusterPendingPod,
            (CloudTargetType::Cluster, "completedjob") => NativeFault::ClusterCompletedJob,
            (target, fault) => {
                return Err(Error::UnsupportedFault(format!("{target}/{fault}")));
            }
        };
        Ok(resolved)
    }

    #[must_use]
    pub fn granularity(self) -> Granularity {
        match self {
            NativeFault::PodLabel | NativeFault::PodDelete => Granularity::Pod,
            NativeFault::PodContainerImage | NativeFault::PodContainerPause => {
                Granularity::Container
            }
            NativeFault::NodeLabel | NativeFault::NodeTaint => Granularity::Node,
            NativeFault::DeploymentReplicas
            | NativeFault::DeploymentDelete
            | NativeFault::DeploymentFinalizer => Granularity::Deployment,
            NativeFault::ClusterPendingPod | NativeFault::ClusterCompletedJob => {
                Granularity::Namespace
            }
        }
    }

    /// Faults executed on the target's host rather than through the API server
    #[must_use]
    pub fn needs_host(self) -> bool {
        self == NativeFault::PodContainerPause
    }

    /// Bulk faults run detached under the cluster-task gate
    #[must_use]
    pub fn is_cluster_task(self) -> bool {
        matches!(
            self,
            NativeFault::ClusterPendingPod | NativeFault::ClusterCompletedJob
        )
    }
}

fn mismatch(fault: NativeFault, target: &AtomicObject) -> Error {
    Error::InvalidTarget(format!(
        "{} is not a valid target for {fault:?}",
        target.object_name()
    ))
}

/// Apply the fault and return the backup needed to undo it
pub async fn inject(
    engine: &Engine,
    fault: NativeFault,
    target: &AtomicObject,
    uid: &str,
    timeout: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    debug!(?fault, target = %target.object_name(), uid, "Applying structural fault");
    let api = engine.cluster.as_ref();

    let backup = match (fault, target) {
        (NativeFault::PodLabel, AtomicObject::Pod(p)) => {
            pod::inject_label(api, &p.namespace, &p.pod_name, args).await?
        }
        (NativeFault::PodDelete, AtomicObject::Pod(p)) => {
            api.delete_pod(&p.namespace, &p.pod_name).await?;
            String::new()
        }
        (NativeFault::PodContainerImage, AtomicObject::Container(c)) => {
            pod::inject_container_image(api, c, args).await?
        }
        (NativeFault::PodContainerPause, AtomicObject::Container(c)) => {
            pod::inject_container_pause(engine.remote.as_ref(), c, uid, timeout, args).await?
        }
        (NativeFault::NodeLabel, AtomicObject::Node(n)) => {
            node::inject_label(api, &n.node_name, args).await?
        }
        (NativeFault::NodeTaint, AtomicObject::Node(n)) => {
            node::inject_taint(api, &n.node_name, args).await?
        }
        (NativeFault::DeploymentReplicas, AtomicObject::Deployment(d)) => {
            deployment::inject_replicas(api, &d.namespace, &d.name, args).await?
        }
        (NativeFault::DeploymentDelete, AtomicObject::Deployment(d)) => {
            api.delete_deployment(&d.namespace, &d.name).await?;
            String::new()
        }
        (NativeFault::DeploymentFinalizer, AtomicObject::Deployment(d)) => {
            deployment::inject_finalizer(api, &d.namespace, &d.name, args).await?
        }
        (
            NativeFault::ClusterPendingPod | NativeFault::ClusterCompletedJob,
            AtomicObject::Namespace(ns),
        ) => bulk::inject(engine, fault, &ns.namespace, args).await?,
        (fault, target) => return Err(mismatch(fault, target)),
    };

    info!(?fault, target = %target.object_name(), uid, "Structural fault applied");
    Ok(backup)
}

/// Undo an earlier inject using its backup
pub async fn recover(
    engine: &Engine,
    fault: NativeFault,
    target: &AtomicObject,
    uid: &str,
    backup: &str,
) -> Result<()> {
    debug!(?fault, target = %target.object_name(), uid, "Recovering structural fault");
    let api = engine.cluster.as_ref();

    match (fault, target) {
        (NativeFault::PodDelete, _) | (NativeFault::DeploymentDelete, _) => {}
        (NativeFault::PodLabel, AtomicObject::Pod(p)) => {
            pod::recover_label(api, &p.namespace, &p.pod_name, backup).await?;
        }
        (NativeFault::PodContainerImage, AtomicObject::Container(c)) => {
            pod::recover_container_image(api, c, backup).await?;
        }
        (NativeFault::PodContainerPause, AtomicObject::Container(_)) => {
            engine.remote.recover(backup, uid).await?;
        }
        (NativeFault::NodeLabel, AtomicObject::Node(n)) => {
            node::recover_label(api, &n.node_name, backup).await?;
        }
        (NativeFault::NodeTaint, AtomicObject::Node(n)) => {
            node::recover_taint(api, &n.node_name, backup).await?;
        }
        (NativeFault::DeploymentReplicas, AtomicObject::Deployment(d)) => {
            deployment::recover_replicas(api, &d.namespace, &d.name, backup).await?;
        }
        (NativeFault::DeploymentFinalizer, AtomicObject::Deployment(d)) => {
            deployment::recover_finalizer(api, &d.namespace, &d.name, backup).await?;
        }
        (
            NativeFault::ClusterPendingPod | NativeFault::ClusterCompletedJob,
            AtomicObject::Namespace(ns),
        ) => bulk::recover(engine, &ns.namespace, backup).await?,
        (fault, target) => return Err(mismatch(fault, target)),
    }

    info!(?fault, target = %target.object_name(), uid, "Structural fault recovered");
    Ok(())
}

/// Progress of a structural fault.
///
/// API mutations take effect synchronously, so only the detached bulk faults
/// and the host-side pause have anything to wait for.
pub async fn query(
    engine: &Engine,
    fault: NativeFault,
    uid: &str,
    backup: &str,
    phase: PhaseType,
) -> Result<SubExpInfo> {
    if fault == NativeFault::PodContainerPause {
        return engine.remote.query(backup, uid, phase).await;
    }

    let bulk_live = fault.is_cluster_task() && engine.gate.is_running();
    let status = if bulk_live && phase == PhaseType::Inject {
        StatusType::Running
    } else {
        StatusType::Success
    };

    Ok(SubExpInfo {
        uid: uid.to_string(),
        status,
        message: String::new(),
        create_time: String::new(),
        update_time: now_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cluster::MockClusterClient;
    use crate::tasks::executor::MockRemoteExecutor;
    use crate::tasks::model::{DeploymentObject, PodObject};
    use std::sync::Arc;

    fn engine(cluster: MockClusterClient, remote: MockRemoteExecutor) -> Engine {
        Engine::with_seed(Arc::new(cluster), Arc::new(remote), 2, 0)
    }

    #[test]
    fn test_resolve_known_faults() {
        assert_eq!(
            NativeFault::resolve(CloudTargetType::Pod, "label").unwrap(),
            NativeFault::PodLabel
        );
        assert_eq!(
            NativeFault::resolve(CloudTargetType::Cluster, "completedjob").unwrap(),
            NativeFault::ClusterCompletedJob
        );
        assert_eq!(
            NativeFault::resolve(CloudTargetType::Pod, "containerpause")
                .unwrap()
                .granularity(),
            Granularity::Container
        );
    }

    #[test]
    fn test_resolve_rejects_unknown_pairs() {
        let err = NativeFault::resolve(CloudTargetType::Node, "replicas").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFault(ref m) if m == "node/replicas"));
        assert!(NativeFault::resolve(CloudTargetType::Job, "delete").is_err());
    }

    #[tokio::test]
    async fn test_delete_has_no_backup_and_noop_recover() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_delete_pod()
            .withf(|ns, name| ns == "default" && name == "web-0")
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = engine(cluster, MockRemoteExecutor::new());
        let target = AtomicObject::Pod(PodObject {
            namespace: "default".to_string(),
            pod_name: "web-0".to_string(),
            ..PodObject::default()
        });

        let backup = inject(&engine, NativeFault::PodDelete, &target, "u1", "", &[])
            .await
            .unwrap();
        assert!(backup.is_empty());
        recover(&engine, NativeFault::PodDelete, &target, "u1", "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_target_kind_mismatch_is_rejected() {
        let engine = engine(MockClusterClient::new(), MockRemoteExecutor::new());
        let target = AtomicObject::Deployment(DeploymentObject {
            namespace: "default".to_string(),
            name: "web".to_string(),
        });

        let err = inject(&engine, NativeFault::NodeLabel, &target, "u1", "", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_query_reports_running_while_cluster_task_live() {
        let engine = engine(MockClusterClient::new(), MockRemoteExecutor::new());
        assert!(engine.gate.try_run(1));

        let info = query(&engine, NativeFault::ClusterPendingPod, "u1", "ns", PhaseType::Inject)
            .await
            .unwrap();
        assert_eq!(info.status, StatusType::Running);

        let info = query(&engine, NativeFault::ClusterPendingPod, "u1", "ns", PhaseType::Recover)
            .await
            .unwrap();
        assert_eq!(info.status, StatusType::Success);

        engine.gate.finish_one();
        let info = query(&engine, NativeFault::ClusterPendingPod, "u1", "ns", PhaseType::Inject)
            .await
            .unwrap();
        assert_eq!(info.status, StatusType::Success);
    }

    #[tokio::test]
    async fn test_pause_query_goes_to_backup_host() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_query()
            .withf(|host, uid, phase| {
                host == "10.0.0.5" && uid == "u1" && *phase == PhaseType::Inject
            })
            .returning(|_, uid, _| {
                Ok(SubExpInfo {
                    uid: uid.to_string(),
                    status: StatusType::Running,
                    ..SubExpInfo::default()
                })
            });
        let engine = engine(MockClusterClient::new(), remote);

        let info = query(
            &engine,
            NativeFault::PodContainerPause,
            "u1",
            "10.0.0.5",
            PhaseType::Inject,
        )
        .await
        .unwrap();
        assert_eq!(info.status, StatusType::Running);
    }
}
