//! Adapter for `cilium.io/v2` CiliumNetworkPolicy objects.
//!
//! Structurally close to native NetworkPolicy but with its own rule schema,
//! so it is parsed dynamically rather than through `k8s-openapi` types.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;
use snafu::{OptionExt, ResultExt};

use crate::{
    adapter::{
        Adapter, DeserializeSnafu, HandledKind, MissingFieldSnafu, ParseError, observed_now,
        source_ref,
    },
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity, SourceRef},
};

const GROUP: &str = "cilium.io";

pub struct CiliumNetworkPolicyAdapter;

impl Adapter for CiliumNetworkPolicyAdapter {
    fn name(&self) -> &'static str {
        "cilium-network-policy"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![HandledKind::new(GROUP, "CiliumNetworkPolicy")]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let spec = object
            .data
            .get("spec")
            .context(MissingFieldSnafu { field: "spec" })?;

        let selector = spec
            .get("endpointSelector")
            .cloned()
            .map(serde_json::from_value::<LabelSelector>)
            .transpose()
            .context(DeserializeSnafu {
                kind: "LabelSelector",
            })?;

        let mut constraints = Vec::new();
        for (field, constraint_type) in [
            ("egress", ConstraintType::NetworkEgress),
            ("egressDeny", ConstraintType::NetworkEgress),
            ("ingress", ConstraintType::NetworkIngress),
            ("ingressDeny", ConstraintType::NetworkIngress),
        ] {
            let Some(rules) = spec.get(field).and_then(|r| r.as_array()) else {
                continue;
            };
            // A second record of the same direction (the deny variant) would
            // collide on identity; fold it into the existing one.
            if constraints
                .iter()
                .any(|c: &Constraint| c.constraint_type == constraint_type)
            {
                continue;
            }
            constraints.push(direction_constraint(
                &source,
                selector.clone(),
                constraint_type,
                field,
                rules.len(),
                object.metadata.resource_version.clone(),
            ));
        }

        Ok(constraints)
    }
}

fn direction_constraint(
    source: &SourceRef,
    selector: Option<LabelSelector>,
    constraint_type: ConstraintType,
    field: &str,
    rules: usize,
    resource_version: Option<String>,
) -> Constraint {
    let direction = if constraint_type == ConstraintType::NetworkEgress {
        "egress"
    } else {
        "ingress"
    };

    let mut details = BTreeMap::new();
    details.insert("direction".to_string(), direction.to_string());
    details.insert("ruleField".to_string(), field.to_string());
    details.insert("allowRules".to_string(), rules.to_string());

    let mut constraint = Constraint {
        source: source.clone(),
        name: source.name.clone(),
        namespace: source.namespace.clone(),
        constraint_type,
        severity: if constraint_type == ConstraintType::NetworkEgress {
            Severity::Critical
        } else {
            Severity::Warning
        },
        effect: Effect::Deny,
        workload_selector: selector,
        scope: Scope::Namespace,
        summary: format!("Cilium policy restricts {direction} traffic for selected endpoints"),
        details,
        tags: Vec::new(),
        last_observed: observed_now(),
        adapter: "cilium-network-policy".to_string(),
        resource_version,
    };
    constraint.push_tag("network");
    constraint.push_tag("cilium");
    constraint.push_tag(direction);
    constraint
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn egress_rules_produce_an_egress_constraint() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cilium.io/v2",
            "kind": "CiliumNetworkPolicy",
            "metadata": {"name": "lock-down", "namespace": "demo"},
            "spec": {
                "endpointSelector": {"matchLabels": {"app": "web"}},
                "egress": [{"toPorts": [{"ports": [{"port": "443", "protocol": "TCP"}]}]}]
            }
        }))
        .unwrap();

        let constraints = CiliumNetworkPolicyAdapter
            .parse(&object, &HandledKind::new(GROUP, "CiliumNetworkPolicy"))
            .unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].constraint_type, ConstraintType::NetworkEgress);
        assert_eq!(constraints[0].severity, Severity::Critical);
        assert!(constraints[0].workload_selector.is_some());
    }

    #[test]
    fn deny_variant_does_not_duplicate_the_direction() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cilium.io/v2",
            "kind": "CiliumNetworkPolicy",
            "metadata": {"name": "lock-down", "namespace": "demo"},
            "spec": {
                "endpointSelector": {},
                "ingress": [{}],
                "ingressDeny": [{}]
            }
        }))
        .unwrap();

        let constraints = CiliumNetworkPolicyAdapter
            .parse(&object, &HandledKind::new(GROUP, "CiliumNetworkPolicy"))
            .unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(
            constraints[0].constraint_type,
            ConstraintType::NetworkIngress
        );
    }
}
