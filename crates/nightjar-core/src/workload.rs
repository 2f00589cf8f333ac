//! A minimal projection of Kubernetes workloads.
//!
//! Workload records are held transiently by the correlator and the
//! annotator. They are never persisted and carry just enough information to
//! match selectors and attribute pods back to their owning controller.

use std::{collections::BTreeMap, fmt::Display};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    Pod,
}

/// Identity of a workload within the cluster.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    pub id: WorkloadRef,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// The controller this workload belongs to, if it has one. For pods this
    /// points at the Deployment/StatefulSet/... that (transitively) owns it.
    pub owner: Option<WorkloadRef>,
}

impl Workload {
    /// The workload notifications should be attached to: the owning
    /// controller when there is one, the workload itself otherwise.
    pub fn controller(&self) -> &WorkloadRef {
        self.owner.as_ref().unwrap_or(&self.id)
    }
}

/// Attributes a pod to its owning controller via the owner reference chain.
///
/// ReplicaSets are not tracked as workloads in their own right; a pod owned
/// by one is attributed to the Deployment the ReplicaSet belongs to by
/// stripping the pod-template hash suffix from the ReplicaSet name.
pub fn pod_owner(pod: &Pod) -> Option<WorkloadRef> {
    let namespace = pod.namespace()?;
    let owner = pod
        .owner_references()
        .iter()
        .find(|reference| reference.controller == Some(true))?;

    match owner.kind.as_str() {
        "ReplicaSet" => {
            let (deployment, hash) = owner.name.rsplit_once('-')?;
            // A pod-template hash is alphanumeric and machine generated. A
            // ReplicaSet that is not owned by a Deployment keeps its full
            // name and is not attributable.
            if hash.is_empty() || !hash.chars().all(char::is_alphanumeric) {
                return None;
            }
            Some(WorkloadRef {
                kind: WorkloadKind::Deployment,
                namespace,
                name: deployment.to_string(),
            })
        }
        "StatefulSet" => Some(WorkloadRef {
            kind: WorkloadKind::StatefulSet,
            namespace,
            name: owner.name.clone(),
        }),
        "DaemonSet" => Some(WorkloadRef {
            kind: WorkloadKind::DaemonSet,
            namespace,
            name: owner.name.clone(),
        }),
        "Job" => Some(WorkloadRef {
            kind: WorkloadKind::Job,
            namespace,
            name: owner.name.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    use super::*;

    fn pod(namespace: &str, owner: Option<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-7d4b9c9f9b-x2x7l".to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner.map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn owner_reference(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    #[test]
    fn replica_set_pods_attribute_to_the_deployment() {
        let pod = pod("demo", Some(owner_reference("ReplicaSet", "web-7d4b9c9f9b")));
        let owner = pod_owner(&pod).unwrap();
        assert_eq!(owner.kind, WorkloadKind::Deployment);
        assert_eq!(owner.name, "web");
        assert_eq!(owner.namespace, "demo");
    }

    #[test]
    fn stateful_set_pods_attribute_directly() {
        let pod = pod("demo", Some(owner_reference("StatefulSet", "db")));
        let owner = pod_owner(&pod).unwrap();
        assert_eq!(owner.kind, WorkloadKind::StatefulSet);
        assert_eq!(owner.name, "db");
    }

    #[test]
    fn unowned_pods_have_no_owner() {
        assert!(pod_owner(&pod("demo", None)).is_none());
    }

    #[test]
    fn unknown_owner_kinds_are_ignored() {
        let pod = pod("demo", Some(owner_reference("CronJob", "tick")));
        assert!(pod_owner(&pod).is_none());
    }
}
