//! Target model: concrete entities a fault can land on, and their stable names
//!
//! The stable name is the only thing persisted in a sub-task. Every reconcile
//! parses it back and resolves a fresh live object.

use crate::tasks::types::{Error, Result};
use std::fmt;
use std::str::FromStr;

const NAME_SPLIT: char = '/';
const CONTAINER_ID_SPLIT: &str = "://";
const DEFAULT_CONTAINER_RUNTIME: &str = "docker";

/// Runtime identity of one container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub runtime: String,
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerObject {
    pub namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    pub pod_ip: String,
    pub node_name: String,
    pub node_ip: String,
    pub container: ContainerInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodObject {
    pub namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    pub pod_ip: String,
    pub node_name: String,
    pub node_ip: String,
    pub containers: Vec<ContainerInfo>,
}

impl PodObject {
    /// One container target per resolved container
    #[must_use]
    pub fn sub_objects(&self) -> Vec<ContainerObject> {
        self.containers
            .iter()
            .map(|container| ContainerObject {
                namespace: self.namespace.clone(),
                pod_name: self.pod_name.clone(),
                pod_uid: self.pod_uid.clone(),
                pod_ip: self.pod_ip.clone(),
                node_name: self.node_name.clone(),
                node_ip: self.node_ip.clone(),
                container: container.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeObject {
    pub node_name: String,
    pub node_ip: String,
    /// Container on the node to operate on, for node-scoped container faults
    pub container: Option<ContainerInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentObject {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceObject {
    pub namespace: String,
}

/// A resolved, live target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AtomicObject {
    Container(ContainerObject),
    Pod(PodObject),
    Node(NodeObject),
    Deployment(DeploymentObject),
    Namespace(NamespaceObject),
}

impl AtomicObject {
    #[must_use]
    pub fn target_name(&self) -> TargetName {
        match self {
            AtomicObject::Container(c) => TargetName::Pod {
                namespace: c.namespace.clone(),
                name: c.pod_name.clone(),
                container: Some(c.container.name.clone()),
            },
            AtomicObject::Pod(p) => TargetName::Pod {
                namespace: p.namespace.clone(),
                name: p.pod_name.clone(),
                container: None,
            },
            AtomicObject::Node(n) => TargetName::Node {
                name: n.node_name.clone(),
                ip: n.node_ip.clone(),
            },
            AtomicObject::Deployment(d) => TargetName::Deployment {
                namespace: d.namespace.clone(),
                name: d.name.clone(),
            },
            AtomicObject::Namespace(n) => TargetName::Namespace {
                name: n.namespace.clone(),
            },
        }
    }

    /// Canonical stable name persisted in the sub-task
    #[must_use]
    pub fn object_name(&self) -> String {
        self.target_name().to_string()
    }

    /// Host address a remote executor must talk to for this target
    #[must_use]
    pub fn host_ip(&self) -> Option<&str> {
        let ip = match self {
            AtomicObject::Container(c) => c.node_ip.as_str(),
            AtomicObject::Pod(p) => p.node_ip.as_str(),
            AtomicObject::Node(n) => n.node_ip.as_str(),
            AtomicObject::Deployment(_) | AtomicObject::Namespace(_) => return None,
        };
        (!ip.is_empty()).then_some(ip)
    }
}

/// Parsed form of a stable target name.
///
/// Formats: `pod/<ns>/<name>[/<container>]`, `node/<name>/<ip>`,
/// `deployment/<ns>/<name>`, `namespace/<name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetName {
    Pod {
        namespace: String,
        name: String,
        container: Option<String>,
    },
    Node {
        name: String,
        ip: String,
    },
    Deployment {
        namespace: String,
        name: String,
    },
    Namespace {
        name: String,
    },
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetName::Pod {
                namespace,
                name,
                container: Some(container),
            } => write!(f, "pod/{namespace}/{name}/{container}"),
            TargetName::Pod {
                namespace,
                name,
                container: None,
            } => write!(f, "pod/{namespace}/{name}"),
            TargetName::Node { name, ip } => write!(f, "node/{name}/{ip}"),
            TargetName::Deployment { namespace, name } => {
                write!(f, "deployment/{namespace}/{name}")
            }
            TargetName::Namespace { name } => write!(f, "namespace/{name}"),
        }
    }
}

impl FromStr for TargetName {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(NAME_SPLIT).collect();
        let invalid = || Error::InvalidTarget(format!("unexpected format of target name: {raw}"));
        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }

        match parts.as_slice() {
            ["pod", namespace, name] => Ok(TargetName::Pod {
                namespace: (*namespace).to_string(),
                name: (*name).to_string(),
                container: None,
            }),
            ["pod", namespace, name, container] => Ok(TargetName::Pod {
                namespace: (*namespace).to_string(),
                name: (*name).to_string(),
                container: Some((*container).to_string()),
            }),
            ["node", name, ip] => Ok(TargetName::Node {
                name: (*name).to_string(),
                ip: (*ip).to_string(),
            }),
            ["deployment", namespace, name] => Ok(TargetName::Deployment {
                namespace: (*namespace).to_string(),
                name: (*name).to_string(),
            }),
            ["namespace", name] => Ok(TargetName::Namespace {
                name: (*name).to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Split `<runtime>://<id>`; a bare id is a docker container.
pub fn parse_container_id(raw: &str) -> Result<(String, String)> {
    if raw.is_empty() {
        return Err(Error::InvalidTarget("container id is empty".to_string()));
    }

    let parts: Vec<&str> = raw.split(CONTAINER_ID_SPLIT).collect();
    match parts.as_slice() {
        [id] => Ok((DEFAULT_CONTAINER_RUNTIME.to_string(), (*id).to_string())),
        [runtime, id] if !runtime.is_empty() && !id.is_empty() => {
            Ok(((*runtime).to_string(), (*id).to_string()))
        }
        _ => Err(Error::InvalidTarget(format!(
            "unexpected container id format: {raw}"
        ))),
    }
}
