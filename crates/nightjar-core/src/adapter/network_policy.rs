//! Adapter for native `networking.k8s.io/v1` NetworkPolicy objects.
//!
//! One policy yields up to two constraints: a [`ConstraintType::NetworkEgress`]
//! record when the policy restricts egress and a
//! [`ConstraintType::NetworkIngress`] record when it restricts ingress.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPort, NetworkPolicySpec};
use kube::core::DynamicObject;
use snafu::OptionExt;

use crate::{
    adapter::{Adapter, HandledKind, MissingFieldSnafu, ParseError, observed_now, source_ref, typed},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity, SourceRef},
};

pub struct NetworkPolicyAdapter;

impl Adapter for NetworkPolicyAdapter {
    fn name(&self) -> &'static str {
        "network-policy"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![HandledKind::new("networking.k8s.io", "NetworkPolicy")]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let policy: NetworkPolicy = typed(object, "NetworkPolicy")?;
        let spec = policy.spec.context(MissingFieldSnafu { field: "spec" })?;

        let mut constraints = Vec::new();
        for policy_type in policy_types(&spec) {
            match policy_type.as_str() {
                "Egress" => constraints.push(direction_constraint(
                    &source,
                    &spec,
                    ConstraintType::NetworkEgress,
                    policy.metadata.resource_version.clone(),
                )),
                "Ingress" => constraints.push(direction_constraint(
                    &source,
                    &spec,
                    ConstraintType::NetworkIngress,
                    policy.metadata.resource_version.clone(),
                )),
                other => {
                    tracing::debug!(policy_type = other, %source, "ignoring unknown policy type");
                }
            }
        }

        Ok(constraints)
    }
}

/// The effective policy types, applying the Kubernetes defaulting rules when
/// `spec.policyTypes` is absent: ingress is always restricted, egress only
/// when egress rules are present.
fn policy_types(spec: &NetworkPolicySpec) -> Vec<String> {
    if let Some(types) = &spec.policy_types {
        return types.clone();
    }

    let mut types = vec!["Ingress".to_string()];
    if spec.egress.is_some() {
        types.push("Egress".to_string());
    }
    types
}

fn direction_constraint(
    source: &SourceRef,
    spec: &NetworkPolicySpec,
    constraint_type: ConstraintType,
    resource_version: Option<String>,
) -> Constraint {
    let (direction, rules, ports) = match constraint_type {
        ConstraintType::NetworkEgress => (
            "egress",
            spec.egress.as_ref().map_or(0, Vec::len),
            spec.egress.as_ref().map_or_else(Vec::new, |rules| {
                rules
                    .iter()
                    .filter_map(|rule| rule.ports.as_ref())
                    .flatten()
                    .collect()
            }),
        ),
        _ => (
            "ingress",
            spec.ingress.as_ref().map_or(0, Vec::len),
            spec.ingress.as_ref().map_or_else(Vec::new, |rules| {
                rules
                    .iter()
                    .filter_map(|rule| rule.ports.as_ref())
                    .flatten()
                    .collect()
            }),
        ),
    };

    // Egress restrictions tend to break workloads outright (DNS, APIs),
    // ingress restrictions usually only affect exposure. A policy without any
    // allow rule denies the whole direction.
    let severity = match constraint_type {
        ConstraintType::NetworkEgress => Severity::Critical,
        _ if rules == 0 => Severity::Critical,
        _ => Severity::Warning,
    };

    let summary = if rules == 0 {
        format!("all {direction} traffic for selected pods is denied")
    } else {
        format!("{direction} traffic for selected pods is limited to {rules} allow rule(s)")
    };

    let mut details = BTreeMap::new();
    details.insert("direction".to_string(), direction.to_string());
    details.insert("allowRules".to_string(), rules.to_string());
    if !ports.is_empty() {
        details.insert("allowedPorts".to_string(), format_ports(&ports));
    }

    let mut constraint = Constraint {
        source: source.clone(),
        name: source.name.clone(),
        namespace: source.namespace.clone(),
        constraint_type,
        severity,
        effect: Effect::Deny,
        workload_selector: Some(spec.pod_selector.clone()),
        scope: Scope::Namespace,
        summary,
        details,
        tags: Vec::new(),
        last_observed: observed_now(),
        adapter: "network-policy".to_string(),
        resource_version,
    };
    constraint.push_tag("network");
    constraint.push_tag(direction);
    constraint
}

fn format_ports(ports: &[&NetworkPolicyPort]) -> String {
    ports
        .iter()
        .map(|port| {
            let number = port.port.as_ref().map_or_else(
                || "any".to_string(),
                |p| match p {
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => {
                        i.to_string()
                    }
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => {
                        s.clone()
                    }
                },
            );
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            format!("{number}/{protocol}")
        })
        .collect::<Vec<_>>()
        .join(",")
}
