//! Adapter for Kyverno policies.
//!
//! `kyverno.io` serves both the namespaced `Policy` and the cluster-wide
//! `ClusterPolicy`; one object yields one constraint either way.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;
use snafu::ResultExt;

use crate::{
    adapter::{Adapter, DeserializeSnafu, HandledKind, ParseError, observed_now, source_ref},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity},
};

const GROUP: &str = "kyverno.io";

pub struct KyvernoAdapter;

impl Adapter for KyvernoAdapter {
    fn name(&self) -> &'static str {
        "kyverno"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![
            HandledKind::new(GROUP, "ClusterPolicy"),
            HandledKind::new(GROUP, "Policy"),
        ]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let spec = object.data.get("spec");

        let action = spec
            .and_then(|s| s.get("validationFailureAction"))
            .and_then(|v| v.as_str())
            .unwrap_or("Audit");
        let enforcing = action.eq_ignore_ascii_case("enforce");
        let (severity, effect) = if enforcing {
            (Severity::Critical, Effect::Deny)
        } else {
            (Severity::Warning, Effect::Audit)
        };

        let rules = spec
            .and_then(|s| s.get("rules"))
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        // The first rule carrying a pod/workload selector decides targeting;
        // Kyverno applies rules independently but one record per policy is
        // enough signal for developers.
        let mut workload_selector = None;
        for rule in &rules {
            let selector = rule
                .pointer("/match/resources/selector")
                .or_else(|| rule.pointer("/match/any/0/resources/selector"));
            if let Some(selector) = selector {
                workload_selector = Some(
                    serde_json::from_value::<LabelSelector>(selector.clone()).context(
                        DeserializeSnafu {
                            kind: "LabelSelector",
                        },
                    )?,
                );
                break;
            }
        }

        let scope = if kind.kind == "ClusterPolicy" {
            Scope::Cluster
        } else {
            Scope::Namespace
        };

        let mut details = BTreeMap::new();
        details.insert("validationFailureAction".to_string(), action.to_string());
        details.insert("rules".to_string(), rules.len().to_string());
        let rule_names: Vec<&str> = rules
            .iter()
            .filter_map(|r| r.get("name").and_then(|n| n.as_str()))
            .collect();
        if !rule_names.is_empty() {
            details.insert("ruleNames".to_string(), rule_names.join(","));
        }

        let mut constraint = Constraint {
            name: source.name.clone(),
            namespace: match scope {
                Scope::Cluster => None,
                Scope::Namespace => source.namespace.clone(),
            },
            summary: format!(
                "Kyverno policy with {count} rule(s) is set to {action}",
                count = rules.len()
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
            adapter: "kyverno".to_string(),
            resource_version: object.metadata.resource_version.clone(),
        };
        constraint.push_tag("kyverno");
        Ok(vec![constraint])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn enforcing_cluster_policy_is_a_critical_deny() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "ClusterPolicy",
            "metadata": {"name": "require-requests"},
            "spec": {
                "validationFailureAction": "Enforce",
                "rules": [{
                    "name": "check-requests",
                    "match": {"resources": {"kinds": ["Pod"], "selector": {"matchLabels": {"app": "web"}}}}
                }]
            }
        }))
        .unwrap();

        let constraints = KyvernoAdapter
            .parse(&object, &HandledKind::new(GROUP, "ClusterPolicy"))
            .unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::PolicyEngine);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.effect, Effect::Deny);
        assert_eq!(c.scope, Scope::Cluster);
        assert!(c.workload_selector.is_some());
        assert_eq!(c.details.get("ruleNames").unwrap(), "check-requests");
    }

    #[test]
    fn audit_policy_in_a_namespace_stays_there() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "Policy",
            "metadata": {"name": "audit-labels", "namespace": "demo"},
            "spec": {"rules": []}
        }))
        .unwrap();

        let constraints = KyvernoAdapter
            .parse(&object, &HandledKind::new(GROUP, "Policy"))
            .unwrap();
        let c = &constraints[0];
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.effect, Effect::Audit);
        assert_eq!(c.scope, Scope::Namespace);
        assert_eq!(c.namespace.as_deref(), Some("demo"));
    }
}
