//! The normalized constraint record and its classification enumerations.
//!
//! Every policy-ish object observed in the cluster is reduced by an adapter
//! to zero or more [`Constraint`]s. The rest of the system only ever deals
//! with this shape.

use std::{collections::BTreeMap, fmt::Display};

use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The closed set of constraint classifications.
///
/// Adapters may not invent values outside of this enumeration. Anything an
/// adapter cannot classify maps to [`ConstraintType::Unknown`].
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumIter, EnumString, Eq, Hash, PartialEq, Serialize,
)]
pub enum ConstraintType {
    NetworkEgress,
    NetworkIngress,
    ResourceLimit,
    ResourceQuota,
    Admission,
    PolicyEngine,
    Mesh,
    Monitoring,
    CertIssuer,
    Unknown,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumIter, EnumString, Eq, Hash, PartialEq, Serialize,
)]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

/// What the originating policy does to workloads it matches.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Deny,
    Warn,
    Limit,
    Audit,
    Require,
}

/// Whether a constraint applies to a single namespace or to the whole cluster.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Namespace,
    Cluster,
}

/// Identity of the cluster object a constraint was derived from.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl SourceRef {
    /// The API group part of `api_version`, empty for the core group.
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

impl Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Primary key of a constraint within the index.
///
/// A single source object may yield multiple constraints (a NetworkPolicy can
/// produce an ingress and an egress record), so the source alone is not
/// enough to identify one.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ConstraintId {
    pub source: SourceRef,
    pub constraint_type: ConstraintType,
    pub name: String,
}

impl Display for ConstraintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.constraint_type)
    }
}

/// The canonical normalized policy record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Constraint {
    /// The cluster object this record was derived from.
    pub source: SourceRef,

    /// Human-readable name, usually equal to the source object name.
    pub name: String,

    /// The namespace the constraint applies in. `None` only for
    /// cluster-scoped constraints; may differ from the source namespace when
    /// the source object is cluster-scoped but targets one namespace.
    pub namespace: Option<String>,

    pub constraint_type: ConstraintType,
    pub severity: Severity,
    pub effect: Effect,

    /// Which workloads the constraint targets. `None` means every workload
    /// in scope.
    pub workload_selector: Option<LabelSelector>,
    pub scope: Scope,

    /// Single line of human text describing the policy effect.
    pub summary: String,
    /// Originating fields, hints and cross-references.
    pub details: BTreeMap<String, String>,
    /// Ordered, duplicate-free set of free-form tags.
    pub tags: Vec<String>,
    pub last_observed: Timestamp,

    /// Name of the adapter that produced this record.
    pub adapter: String,
    /// `metadata.resourceVersion` of the source object at observation time.
    pub resource_version: Option<String>,
}

impl Constraint {
    pub fn id(&self) -> ConstraintId {
        ConstraintId {
            source: self.source.clone(),
            constraint_type: self.constraint_type,
            name: self.name.clone(),
        }
    }

    /// Whether this constraint shows up in queries for `namespace`.
    ///
    /// Cluster-scoped constraints show up everywhere.
    pub fn applies_to_namespace(&self, namespace: &str) -> bool {
        match self.scope {
            Scope::Cluster => true,
            Scope::Namespace => self.namespace.as_deref() == Some(namespace),
        }
    }

    /// Whether this constraint affects a workload with the given labels in
    /// the given namespace. A constraint without a selector targets every
    /// workload in scope; a selector that fails to evaluate targets none.
    pub fn selects(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        use crate::selector::LabelSelectorExt;

        if !self.applies_to_namespace(namespace) {
            return false;
        }
        match &self.workload_selector {
            None => true,
            Some(selector) => selector.matches(labels).unwrap_or(false),
        }
    }

    /// Payload comparison for change detection.
    ///
    /// `last_observed` and `resource_version` change on every re-observation
    /// and must not count as an update on their own.
    pub fn payload_eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.name == other.name
            && self.namespace == other.namespace
            && self.constraint_type == other.constraint_type
            && self.severity == other.severity
            && self.effect == other.effect
            && self.workload_selector == other.workload_selector
            && self.scope == other.scope
            && self.summary == other.summary
            && self.details == other.details
            && self.tags == other.tags
    }

    /// Appends a tag unless it is already present, keeping insertion order.
    pub fn push_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Best-effort numeric interpretation of the source resource version.
    ///
    /// Kubernetes resource versions are opaque strings, but every supported
    /// cluster implementation uses decimal integers. Non-numeric versions
    /// compare as unknown.
    pub fn numeric_resource_version(&self) -> Option<u64> {
        self.resource_version.as_deref()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn constraint(namespace: Option<&str>, scope: Scope) -> Constraint {
        Constraint {
            source: SourceRef {
                api_version: "networking.k8s.io/v1".to_string(),
                kind: "NetworkPolicy".to_string(),
                namespace: namespace.map(str::to_string),
                name: "restrict-egress".to_string(),
            },
            name: "restrict-egress".to_string(),
            namespace: namespace.map(str::to_string),
            constraint_type: ConstraintType::NetworkEgress,
            severity: Severity::Critical,
            effect: Effect::Deny,
            workload_selector: None,
            scope,
            summary: "egress restricted".to_string(),
            details: BTreeMap::new(),
            tags: Vec::new(),
            last_observed: Timestamp::UNIX_EPOCH,
            adapter: "network-policy".to_string(),
            resource_version: Some("42".to_string()),
        }
    }

    #[test]
    fn cluster_scope_applies_everywhere() {
        let c = constraint(None, Scope::Cluster);
        assert!(c.applies_to_namespace("demo"));
        assert!(c.applies_to_namespace("kube-system"));
    }

    #[test]
    fn namespace_scope_applies_only_in_its_namespace() {
        let c = constraint(Some("demo"), Scope::Namespace);
        assert!(c.applies_to_namespace("demo"));
        assert!(!c.applies_to_namespace("other"));
    }

    #[test]
    fn payload_eq_ignores_observation_metadata() {
        let a = constraint(Some("demo"), Scope::Namespace);
        let mut b = a.clone();
        b.last_observed = Timestamp::from_str("2024-05-01T00:00:00Z").unwrap();
        b.resource_version = Some("43".to_string());
        assert!(a.payload_eq(&b));

        b.severity = Severity::Info;
        assert!(!a.payload_eq(&b));
    }

    #[test]
    fn classification_round_trips_through_strings() {
        assert_eq!(
            ConstraintType::from_str("NetworkEgress").unwrap(),
            ConstraintType::NetworkEgress
        );
        assert_eq!(Severity::from_str("Warning").unwrap(), Severity::Warning);
        assert_eq!(Effect::Deny.to_string(), "deny");
        assert!(ConstraintType::from_str("SomethingElse").is_err());
    }

    #[test]
    fn push_tag_keeps_order_and_uniqueness() {
        let mut c = constraint(Some("demo"), Scope::Namespace);
        c.push_tag("network");
        c.push_tag("egress");
        c.push_tag("network");
        assert_eq!(c.tags, vec!["network", "egress"]);
    }
}
