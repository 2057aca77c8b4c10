//! Node-level structural faults: labels and taints

use super::labels::{labels_patch, merge_list, new_labels, restore_labels};
use crate::crds::experiment::ArgsUnit;
use crate::tasks::cluster::{ClusterClient, ResourcePatch};
use crate::tasks::common::get_arg;
use crate::tasks::types::Result;
use k8s_openapi::api::core::v1::Taint;
use serde_json::json;
use tracing::warn;

pub async fn inject_label(
    cluster: &dyn ClusterClient,
    name: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let node = cluster.get_node(name).await?;
    let old = node.metadata.labels.unwrap_or_default();
    let labels = new_labels(
        &old,
        get_arg(args, "add").unwrap_or_default(),
        get_arg(args, "delete").unwrap_or_default(),
    )?;

    cluster
        .patch_node(name, ResourcePatch::Merge(labels_patch(labels)))
        .await?;
    Ok(serde_json::to_string(&old)?)
}

pub async fn recover_label(cluster: &dyn ClusterClient, name: &str, backup: &str) -> Result<()> {
    let node = cluster.get_node(name).await?;
    let labels = restore_labels(backup, &node.metadata.labels.unwrap_or_default())?;
    cluster
        .patch_node(name, ResourcePatch::Merge(labels_patch(labels)))
        .await
}

/// `key=value:effect`
fn taint_string(taint: &Taint) -> String {
    format!(
        "{}={}:{}",
        taint.key,
        taint.value.as_deref().unwrap_or_default(),
        taint.effect
    )
}

fn parse_taint(raw: &str) -> Option<Taint> {
    let (key, rest) = raw.split_once('=')?;
    let (value, effect) = rest.rsplit_once(':')?;
    if key.is_empty() || effect.is_empty() {
        return None;
    }

    Some(Taint {
        key: key.to_string(),
        value: (!value.is_empty()).then(|| value.to_string()),
        effect: effect.to_string(),
        time_added: None,
    })
}

/// Taints after applying `add`/`delete`, both given as `key=value:effect` lists
#[must_use]
pub fn merge_taints(old: &[Taint], add: &str, delete: &str) -> Vec<Taint> {
    let current: Vec<String> = old.iter().map(taint_string).collect();
    merge_list(&current, add, delete)
        .iter()
        .filter_map(|raw| {
            let taint = parse_taint(raw);
            if taint.is_none() {
                warn!(
                    taint = %raw,
                    "Dropping taint with invalid format, expected key=value:effect"
                );
            }
            taint
        })
        .collect()
}

fn taints_patch(taints: &[Taint]) -> ResourcePatch {
    ResourcePatch::Merge(json!({ "spec": { "taints": taints } }))
}

pub async fn inject_taint(
    cluster: &dyn ClusterClient,
    name: &str,
    args: &[ArgsUnit],
) -> Result<String> {
    let node = cluster.get_node(name).await?;
    let old = node.spec.and_then(|spec| spec.taints).unwrap_or_default();
    let taints = merge_taints(
        &old,
        get_arg(args, "add").unwrap_or_default(),
        get_arg(args, "delete").unwrap_or_default(),
    );

    cluster.patch_node(name, taints_patch(&taints)).await?;
    Ok(serde_json::to_string(&old)?)
}

pub async fn recover_taint(cluster: &dyn ClusterClient, name: &str, backup: &str) -> Result<()> {
    let taints: Vec<Taint> = if backup.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(backup)?
    };
    cluster.patch_node(name, taints_patch(&taints)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cluster::MockClusterClient;
    use k8s_openapi::api::core::v1::{Node, NodeSpec};

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: Some(value.to_string()),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    #[test]
    fn test_taint_string_round_trip() {
        let t = taint("dedicated", "gpu", "NoSchedule");
        assert_eq!(taint_string(&t), "dedicated=gpu:NoSchedule");
        assert_eq!(parse_taint("dedicated=gpu:NoSchedule"), Some(t));
    }

    #[test]
    fn test_parse_taint_rejects_bad_format() {
        assert_eq!(parse_taint("dedicated"), None);
        assert_eq!(parse_taint("dedicated=gpu"), None);
        assert_eq!(parse_taint("=gpu:NoSchedule"), None);
    }

    #[test]
    fn test_merge_taints_delete_then_add() {
        let old = vec![
            taint("a", "1", "NoSchedule"),
            taint("b", "2", "NoExecute"),
        ];
        let merged = merge_taints(&old, "c=3:NoSchedule,broken", "a=1:NoSchedule");

        assert_eq!(
            merged,
            vec![taint("b", "2", "NoExecute"), taint("c", "3", "NoSchedule")]
        );
    }

    #[tokio::test]
    async fn test_taint_inject_and_recover() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_node().returning(|_| {
            Ok(Node {
                spec: Some(NodeSpec {
                    taints: Some(vec![taint("a", "1", "NoSchedule")]),
                    ..NodeSpec::default()
                }),
                ..Node::default()
            })
        });
        cluster
            .expect_patch_node()
            .withf(|name, patch| {
                let added = match patch {
                    ResourcePatch::Merge(v) => v["spec"]["taints"].as_array().map(Vec::len),
                    ResourcePatch::Strategic(_) => None,
                };
                name == "node-1" && added == Some(2)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let args = vec![ArgsUnit::new("add", "chaos=on:NoExecute", "string")];
        let backup = inject_taint(&cluster, "node-1", &args).await.unwrap();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_patch_node()
            .withf(|_, patch| {
                matches!(patch, ResourcePatch::Merge(v) if v["spec"]["taints"][0]["key"] == "a"
                    && v["spec"]["taints"].as_array().map(Vec::len) == Some(1))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        recover_taint(&cluster, "node-1", &backup).await.unwrap();
    }
}
