//! Deployment-level structural faults: replica scaling and finalizers

use super::labels::merge_list;
use crate::crds::experiment::ArgsUnit;
use crate::tasks::cluster::{ClusterClient, ResourcePatch};
use crate::tasks::common::get_arg;
use crate::tasks::types::{Error, Result};
use serde_json::json;
use std::str::FromStr;

/// How the `value` argument of the replicas fault is applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicasMode {
    AbsoluteCount,
    RelativeCount,
    RelativePercent,
}

impl FromStr for ReplicasMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "absolutecount" => Ok(ReplicasMode::AbsoluteCount),
            "relativecount" => Ok(ReplicasMode::RelativeCount),
            "relativepercent" => Ok(ReplicasMode::RelativePercent),
            other => Err(Error::InvalidArgument(format!(
                "not support replicas mode: {other}"
            ))),
        }
    }
}

/// Target replica count, never below zero
#[must_use]
pub fn target_replicas(old: i32, mode: ReplicasMode, value: i32) -> i32 {
    let target = match mode {
        ReplicasMode::AbsoluteCount => i64::from(value),
        ReplicasMode::RelativeCount => i64::from(old) + i64::from(value),
        ReplicasMode::RelativePercent => i64::from(old) + i64::from(value) * i64::from(old) / 100,
    };
    i32::try_from(target.max(0)).unwrap_or(i32::MAX)
}

fn replicas_args(args: &[ArgsUnit]) -> Result<(ReplicasMode, i32)> {
    let mode: ReplicasMode = get_arg(args, "mode").unwrap_or_default().parse()?;
    let raw = get_arg(args, "value").unwrap_or_default();
    let value = raw
        .parse::<i32>()
        .map_err(|_| Error::InvalidArgument(format!("\"value\" is not a num: {raw}")))?;
    Ok((mode, value))
}

pub async fn inject_replicas(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let (mode, value) = replicas_args(args)?;
    let deployment = cluster.get_deployment(namespace, name).await?;
    let old = deployment
        .spec
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);

    let target = target_replicas(old, mode, value);
    if target != old {
        cluster.scale_deployment(namespace, name, target).await?;
    }
    Ok(old.to_string())
}

pub async fn recover_replicas(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    backup: &str,
) -> Result<()> {
    let replicas = backup.parse::<i32>().map_err(|_| {
        Error::InvalidArgument(format!("backup replicas[{backup}] is not a num"))
    })?;
    cluster.scale_deployment(namespace, name, replicas).await
}

fn finalizers_patch(finalizers: &[String]) -> ResourcePatch {
    ResourcePatch::Merge(json!({ "metadata": { "finalizers": finalizers } }))
}

pub async fn inject_finalizer(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let deployment = cluster.get_deployment(namespace, name).await?;
    let old = deployment.metadata.finalizers.unwrap_or_default();
    let finalizers = merge_list(
        &old,
        get_arg(args, "add").unwrap_or_default(),
        get_arg(args, "delete").unwrap_or_default(),
    );

    cluster
        .patch_deployment(namespace, name, finalizers_patch(&finalizers))
        .await?;
    Ok(serde_json::to_string(&old)?)
}

pub async fn recover_finalizer(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    backup: &str,
) -> Result<()> {
    let finalizers: Vec<String> = if backup.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(backup)?
    };
    cluster
        .patch_deployment(namespace, name, finalizers_patch(&finalizers))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cluster::MockClusterClient;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use kube::core::ObjectMeta;

    fn deployment(replicas: i32, finalizers: &[&str]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                finalizers: Some(finalizers.iter().map(|f| (*f).to_string()).collect()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn test_target_replicas_modes() {
        assert_eq!(target_replicas(4, ReplicasMode::AbsoluteCount, 1), 1);
        assert_eq!(target_replicas(4, ReplicasMode::RelativeCount, -2), 2);
        assert_eq!(target_replicas(4, ReplicasMode::RelativeCount, -10), 0);
        assert_eq!(target_replicas(4, ReplicasMode::RelativePercent, 50), 6);
        assert_eq!(target_replicas(4, ReplicasMode::RelativePercent, -100), 0);
    }

    #[test]
    fn test_replicas_args_validation() {
        assert!("bogus".parse::<ReplicasMode>().is_err());
        let args = vec![
            ArgsUnit::new("mode", "absolutecount", "string"),
            ArgsUnit::new("value", "three", "string"),
        ];
        assert!(replicas_args(&args).is_err());
    }

    #[tokio::test]
    async fn test_replicas_inject_scales_and_backs_up() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_deployment()
            .returning(|_, _| Ok(deployment(3, &[])));
        cluster
            .expect_scale_deployment()
            .withf(|ns, name, replicas| ns == "default" && name == "web" && *replicas == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let args = vec![
            ArgsUnit::new("mode", "absolutecount", "string"),
            ArgsUnit::new("value", "0", "int"),
        ];
        let backup = inject_replicas(&cluster, "default", "web", &args).await.unwrap();
        assert_eq!(backup, "3");
    }

    #[tokio::test]
    async fn test_unchanged_replicas_skip_scaling() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_deployment()
            .returning(|_, _| Ok(deployment(3, &[])));
        cluster.expect_scale_deployment().never();

        let args = vec![
            ArgsUnit::new("mode", "relativecount", "string"),
            ArgsUnit::new("value", "0", "int"),
        ];
        assert_eq!(
            inject_replicas(&cluster, "default", "web", &args).await.unwrap(),
            "3"
        );
    }

    #[tokio::test]
    async fn test_finalizer_inject_merges_without_duplicates() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_deployment()
            .returning(|_, _| Ok(deployment(1, &["keep", "chaos/hold"])));
        cluster
            .expect_patch_deployment()
            .withf(|_, _, patch| {
                *patch
                    == ResourcePatch::Merge(json!({
                        "metadata": { "finalizers": ["keep", "chaos/hold"] }
                    }))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let args = vec![ArgsUnit::new("add", "chaos/hold", "string")];
        let backup = inject_finalizer(&cluster, "default", "web", &args).await.unwrap();
        assert_eq!(backup, r#"["keep","chaos/hold"]"#);
    }

    #[tokio::test]
    async fn test_recover_replicas_rejects_bad_backup() {
        let cluster = MockClusterClient::new();
        assert!(recover_replicas(&cluster, "default", "web", "")
            .await
            .is_err());
    }
}
