//! Adapter for OPA Gatekeeper constraint instances.
//!
//! Gatekeeper materializes one CRD per constraint template, all in the
//! `constraints.gatekeeper.sh` group, so this adapter claims the whole group
//! via a kind wildcard.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;
use snafu::ResultExt;

use crate::{
    adapter::{Adapter, DeserializeSnafu, HandledKind, ParseError, observed_now, source_ref},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity},
};

const GROUP: &str = "constraints.gatekeeper.sh";

pub struct GatekeeperAdapter;

impl Adapter for GatekeeperAdapter {
    fn name(&self) -> &'static str {
        "gatekeeper"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![HandledKind::any_in_group(GROUP)]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let spec = object.data.get("spec");

        let enforcement = spec
            .and_then(|s| s.get("enforcementAction"))
            .and_then(|v| v.as_str())
            // Gatekeeper denies when the action is unset.
            .unwrap_or("deny");
        let (severity, effect) = match enforcement {
            "deny" => (Severity::Critical, Effect::Deny),
            "warn" => (Severity::Warning, Effect::Warn),
            _ => (Severity::Warning, Effect::Audit),
        };

        let match_block = spec.and_then(|s| s.get("match"));
        let workload_selector = match_block
            .and_then(|m| m.get("labelSelector"))
            .cloned()
            .map(serde_json::from_value::<LabelSelector>)
            .transpose()
            .context(DeserializeSnafu {
                kind: "LabelSelector",
            })?;

        // Constraints are cluster-scoped, but a match block naming exactly
        // one namespace narrows the constraint to it.
        let matched_namespaces: Vec<String> = match_block
            .and_then(|m| m.get("namespaces"))
            .and_then(|n| n.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let (scope, namespace) = match matched_namespaces.as_slice() {
            [single] => (Scope::Namespace, Some(single.clone())),
            _ => (Scope::Cluster, None),
        };

        let mut details = BTreeMap::new();
        details.insert("template".to_string(), source.kind.clone());
        details.insert("enforcementAction".to_string(), enforcement.to_string());
        if !matched_namespaces.is_empty() {
            details.insert("namespaces".to_string(), matched_namespaces.join(","));
        }
        if let Some(parameters) = spec.and_then(|s| s.get("parameters")) {
            details.insert("parameters".to_string(), parameters.to_string());
        }

        let mut constraint = Constraint {
            name: source.name.clone(),
            namespace,
            summary: format!(
                "Gatekeeper policy {template} is set to {enforcement}",
                template = source.kind
            ),
            source,
            constraint_type: ConstraintType::PolicyEngine,
            severity,
            effect,
            workload_selector,
            scope,
            details,
            tags: Vec::new(),
            last_observed: observed_now(),
            adapter: "gatekeeper".to_string(),
            resource_version: object.metadata.resource_version.clone(),
        };
        constraint.push_tag("gatekeeper");
        Ok(vec![constraint])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn kind() -> HandledKind {
        HandledKind::new(GROUP, "K8sRequiredLabels")
    }

    #[test]
    fn deny_constraints_are_critical() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "constraints.gatekeeper.sh/v1beta1",
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "require-team-label", "resourceVersion": "5"},
            "spec": {
                "enforcementAction": "deny",
                "match": {"labelSelector": {"matchLabels": {"app": "web"}}},
                "parameters": {"labels": ["team"]}
            }
        }))
        .unwrap();

        let constraints = GatekeeperAdapter.parse(&object, &kind()).unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::PolicyEngine);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.effect, Effect::Deny);
        assert_eq!(c.scope, Scope::Cluster);
        assert!(c.workload_selector.is_some());
        assert_eq!(c.details.get("template").unwrap(), "K8sRequiredLabels");
    }

    #[test]
    fn dryrun_downgrades_to_audit() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "constraints.gatekeeper.sh/v1beta1",
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "audit-only"},
            "spec": {"enforcementAction": "dryrun"}
        }))
        .unwrap();

        let constraints = GatekeeperAdapter.parse(&object, &kind()).unwrap();
        assert_eq!(constraints[0].severity, Severity::Warning);
        assert_eq!(constraints[0].effect, Effect::Audit);
    }

    #[test]
    fn single_namespace_match_narrows_scope() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "constraints.gatekeeper.sh/v1beta1",
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "demo-only"},
            "spec": {"match": {"namespaces": ["demo"]}}
        }))
        .unwrap();

        let constraints = GatekeeperAdapter.parse(&object, &kind()).unwrap();
        assert_eq!(constraints[0].scope, Scope::Namespace);
        assert_eq!(constraints[0].namespace.as_deref(), Some("demo"));
        assert!(!constraints[0].applies_to_namespace("other"));
    }
}
