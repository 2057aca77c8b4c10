//! Merge helpers for label maps and string sets (finalizers, taints)
//!
//! Every mutation starts from the existing set, drops the `delete` entries and
//! then applies the `add` entries.

use crate::crds::experiment::LABEL_LIST_SPLIT;
use crate::tasks::common::split_list;
use crate::tasks::types::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Parse `k=v,k=v`; later duplicates win.
pub fn parse_label_pairs(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for unit in split_list(raw) {
        let kv: Vec<&str> = unit.split(LABEL_LIST_SPLIT).collect();
        match kv.as_slice() {
            [key, value] if !key.is_empty() => {
                pairs.insert((*key).to_string(), (*value).to_string());
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{unit} is error label format, true format is key=value"
                )))
            }
        }
    }
    Ok(pairs)
}

/// Full label map after the mutation, with deleted keys set to null so it can
/// be sent as a merge patch.
pub fn new_labels(
    old: &BTreeMap<String, String>,
    add: &str,
    delete: &str,
) -> Result<Map<String, Value>> {
    let added = parse_label_pairs(add)?;
    let deleted: HashSet<String> = split_list(delete).into_iter().collect();

    let mut labels = Map::new();
    for (key, value) in old {
        if deleted.contains(key) {
            labels.insert(key.clone(), Value::Null);
        } else {
            labels.insert(key.clone(), Value::from(value.clone()));
        }
    }
    for (key, value) in added {
        labels.insert(key, Value::from(value));
    }
    Ok(labels)
}

/// Merge patch restoring the backed-up labels; keys absent from the backup
/// are removed.
pub fn restore_labels(backup: &str, now: &BTreeMap<String, String>) -> Result<Map<String, Value>> {
    let mut labels: Map<String, Value> = if backup.is_empty() {
        Map::new()
    } else {
        serde_json::from_str(backup)
            .map_err(|e| Error::InvalidArgument(format!("backup labels is not a json: {e}")))?
    };

    for key in now.keys() {
        if !labels.contains_key(key) {
            labels.insert(key.clone(), Value::Null);
        }
    }
    Ok(labels)
}

#[must_use]
pub fn labels_patch(labels: Map<String, Value>) -> Value {
    json!({ "metadata": { "labels": labels } })
}

/// Set merge used for finalizers and taints: drop `delete`, then append each
/// `add` entry not already present. The result never has duplicates.
#[must_use]
pub fn merge_list(old: &[String], add: &str, delete: &str) -> Vec<String> {
    let added = split_list(add);
    let deleted: HashSet<String> = split_list(delete).into_iter().collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(old.len() + added.len());
    for unit in old.iter().chain(added.iter()) {
        if deleted.contains(unit) && !added.contains(unit) {
            continue;
        }
        if seen.insert(unit.clone()) {
            merged.push(unit.clone());
        }
    }
    merged
}
