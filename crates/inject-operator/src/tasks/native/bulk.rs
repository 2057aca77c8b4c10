//! Bulk resource creation in one namespace: pending pods and completed jobs
//!
//! A run is split into shards, one per worker, and admitted through the
//! cluster-task gate. Workers are detached; progress is observed through the
//! gate rather than the inject call.

use super::NativeFault;
use crate::crds::experiment::ArgsUnit;
use crate::tasks::cluster::ClusterClient;
use crate::tasks::common::get_arg;
use crate::tasks::engine::{bulk_workers, Engine, CLUSTER_TASK_STOP_POLL};
use crate::tasks::gate::ClusterTaskGate;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PENDING_POD_IMAGE: &str = "chaosmetapending:v1";
const PENDING_POD_CONTAINER: &str = "chaosmeta";
/// Request no node can satisfy, so the pod stays Pending
const UNSCHEDULABLE_QUANTITY: &str = "1000000000000000000";
const JOB_IMAGE: &str = "centos:centos7";
const JOB_CONTAINER: &str = "chaosjob";

#[derive(Debug, Clone, PartialEq, Eq)]
struct BulkArgs {
    count: usize,
    name: String,
}

fn bulk_args(args: &[ArgsUnit]) -> Result<BulkArgs> {
    let count = get_arg(args, "count")
        .unwrap_or_default()
        .parse::<usize>()
        .map_err(|_| Error::InvalidArgument("\"count\" is not a num".to_string()))?;
    let name = get_arg(args, "name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidArgument("args \"name\" is empty".to_string()))?;

    Ok(BulkArgs {
        count,
        name: name.to_string(),
    })
}

/// Split `0..count` into `workers` contiguous shards; the last takes the rest
#[must_use]
pub fn shards(count: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let size = count / workers;
    (0..workers)
        .map(|w| {
            let start = w * size;
            let end = if w + 1 == workers { count } else { start + size };
            start..end
        })
        .collect()
}

fn pending_pod(namespace: &str, name: String) -> Pod {
    let requests = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(UNSCHEDULABLE_QUANTITY.to_string()),
        ),
        (
            "memory".to_string(),
            Quantity(UNSCHEDULABLE_QUANTITY.to_string()),
        ),
    ]);

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: PENDING_POD_CONTAINER.to_string(),
                image: Some(PENDING_POD_IMAGE.to_string()),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..ResourceRequirements::default()
                }),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn completed_job(namespace: &str, name: String) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: JOB_CONTAINER.to_string(),
                        image: Some(JOB_IMAGE.to_string()),
                        command: Some(vec!["echo".to_string(), "ok".to_string()]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// Releases one gate slot when a worker exits, however it exits
struct WorkerGuard(Arc<ClusterTaskGate>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

async fn run_shard(
    cluster: Arc<dyn ClusterClient>,
    gate: Arc<ClusterTaskGate>,
    fault: NativeFault,
    namespace: String,
    prefix: String,
    shard: Range<usize>,
) {
    let _guard = WorkerGuard(Arc::clone(&gate));
    for i in shard {
        if gate.is_stopping() {
            debug!(%namespace, "Cluster task stop observed, skipping remaining work");
            return;
        }

        let name = format!("{prefix}-{i}");
        let created = if fault == NativeFault::ClusterCompletedJob {
            cluster.create_job(&namespace, completed_job(&namespace, name.clone())).await
        } else {
            cluster.create_pod(&namespace, pending_pod(&namespace, name.clone())).await
        };
        if let Err(e) = created {
            warn!(%namespace, %name, error = ?e, "Failed to create bulk resource");
        }
    }
}

/// Start a detached bulk run; the backup is the namespace to clean up
pub async fn inject(
    engine: &Engine,
    fault: NativeFault,
    namespace: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let BulkArgs { count, name } = bulk_args(args)?;
    engine.cluster.create_namespace(namespace).await?;

    let workers = bulk_workers();
    let admitted = i64::try_from(workers).is_ok_and(|n| engine.gate.try_run(n));
    if !admitted {
        return Err(Error::ClusterTaskBusy);
    }

    info!(%namespace, count, workers, ?fault, "Starting cluster task");
    for shard in shards(count, workers) {
        tokio::spawn(run_shard(
            Arc::clone(&engine.cluster),
            Arc::clone(&engine.gate),
            fault,
            namespace.to_string(),
            name.clone(),
            shard,
        ));
    }
    Ok(namespace.to_string())
}

/// Drain any running workers, then drop everything they created
pub async fn recover(engine: &Engine, namespace: &str, backup: &str) -> Result<()> {
    engine.gate.stop(CLUSTER_TASK_STOP_POLL).await;

    let target = if backup.is_empty() { namespace } else { backup };
    engine.cluster.delete_namespace(target).await
}
