//! The fallback adapter for custom resources no specific adapter claims.
//!
//! It produces a single low-confidence constraint per object: metadata gives
//! identity, a `spec.*Selector` field shaped like a label selector gives
//! targeting, and the `nightjar.io/*` annotation convention lets resource
//! authors override classification.

use std::{collections::BTreeMap, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;
use serde_json::Value;

use crate::{
    adapter::{Adapter, HandledKind, ParseError, observed_now, source_ref},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity},
};

pub const ANNOTATION_TYPE: &str = "nightjar.io/constraint-type";
pub const ANNOTATION_SEVERITY: &str = "nightjar.io/severity";
pub const ANNOTATION_SUMMARY: &str = "nightjar.io/summary";

/// API groups whose custom resources have a well-known classification even
/// without annotations.
const GROUP_HINTS: &[(&str, ConstraintType)] = &[
    ("monitoring.coreos.com", ConstraintType::Monitoring),
    ("networking.istio.io", ConstraintType::Mesh),
    ("security.istio.io", ConstraintType::Mesh),
    ("cert-manager.io", ConstraintType::CertIssuer),
];

pub struct GenericAdapter;

impl Adapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        // Consulted as the fallback; claims nothing up front.
        Vec::new()
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let annotations = object.metadata.annotations.clone().unwrap_or_default();

        let mut constraint_type = GROUP_HINTS
            .iter()
            .find(|(group, _)| *group == kind.group)
            .map_or(ConstraintType::Unknown, |(_, t)| *t);
        let mut severity = Severity::Info;
        let mut summary = format!("custom resource {} may constrain workloads", source.kind);

        if let Some(value) = annotations.get(ANNOTATION_TYPE) {
            constraint_type =
                ConstraintType::from_str(value).map_err(|_| ParseError::InvalidClassification {
                    annotation: ANNOTATION_TYPE.to_string(),
                    value: value.clone(),
                })?;
        }
        if let Some(value) = annotations.get(ANNOTATION_SEVERITY) {
            severity = Severity::from_str(value).map_err(|_| ParseError::InvalidClassification {
                annotation: ANNOTATION_SEVERITY.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = annotations.get(ANNOTATION_SUMMARY) {
            summary = value.clone();
        }

        let workload_selector = object.data.get("spec").and_then(infer_selector);

        let scope = if source.namespace.is_some() {
            Scope::Namespace
        } else {
            Scope::Cluster
        };

        let mut details = BTreeMap::new();
        details.insert("group".to_string(), kind.group.clone());
        details.insert("kind".to_string(), source.kind.clone());

        let mut constraint = Constraint {
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            source,
            constraint_type,
            severity,
            effect: Effect::Audit,
            workload_selector,
            scope,
            summary,
            details,
            tags: Vec::new(),
            last_observed: observed_now(),
            adapter: "generic".to_string(),
            resource_version: object.metadata.resource_version.clone(),
        };
        constraint.push_tag("generic");
        Ok(vec![constraint])
    }
}

/// Looks for a field in `spec` that has the shape of a label selector.
///
/// Accepts both the structured form (`matchLabels`/`matchExpressions`) and
/// the shorthand flat string map some CRDs use for `selector`.
fn infer_selector(spec: &Value) -> Option<LabelSelector> {
    let spec = spec.as_object()?;

    for (key, value) in spec {
        if !key.eq_ignore_ascii_case("selector") && !key.ends_with("Selector") {
            continue;
        }
        let Some(candidate) = value.as_object() else {
            continue;
        };

        if candidate.contains_key("matchLabels") || candidate.contains_key("matchExpressions") {
            if let Ok(selector) = serde_json::from_value::<LabelSelector>(value.clone()) {
                return Some(selector);
            }
            continue;
        }

        if !candidate.is_empty() && candidate.values().all(Value::is_string) {
            let match_labels: BTreeMap<String, String> = candidate
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            return Some(LabelSelector {
                match_labels: Some(match_labels),
                ..LabelSelector::default()
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn widget_kind() -> HandledKind {
        HandledKind::new("example.com", "Widget")
    }

    #[test]
    fn unannotated_resources_default_to_unknown_info() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "thing", "namespace": "demo"},
            "spec": {"replicas": 3}
        }))
        .unwrap();

        let constraints = GenericAdapter.parse(&object, &widget_kind()).unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::Unknown);
        assert_eq!(c.severity, Severity::Info);
        assert_eq!(c.scope, Scope::Namespace);
        assert!(c.workload_selector.is_none());
    }

    #[test]
    fn annotations_override_classification() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {
                "name": "thing",
                "namespace": "demo",
                "annotations": {
                    "nightjar.io/constraint-type": "Admission",
                    "nightjar.io/severity": "Warning",
                    "nightjar.io/summary": "X"
                }
            }
        }))
        .unwrap();

        let constraints = GenericAdapter.parse(&object, &widget_kind()).unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::Admission);
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.summary, "X");
    }

    #[test]
    fn out_of_enum_annotation_values_are_rejected() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {
                "name": "thing",
                "namespace": "demo",
                "annotations": {"nightjar.io/severity": "Catastrophic"}
            }
        }))
        .unwrap();

        let err = GenericAdapter.parse(&object, &widget_kind()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidClassification { .. }));
    }

    #[test]
    fn spec_selector_fields_are_sniffed() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "monitoring.coreos.com/v1",
            "kind": "ServiceMonitor",
            "metadata": {"name": "web-monitor", "namespace": "demo"},
            "spec": {"selector": {"matchLabels": {"app": "web"}}}
        }))
        .unwrap();

        let constraints = GenericAdapter
            .parse(
                &object,
                &HandledKind::new("monitoring.coreos.com", "ServiceMonitor"),
            )
            .unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::Monitoring);
        let selector = c.workload_selector.as_ref().unwrap();
        assert_eq!(
            selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("app")
                .map(String::as_str),
            Some("web")
        );
    }

    #[test]
    fn flat_string_map_selectors_become_match_labels() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "thing", "namespace": "demo"},
            "spec": {"podSelector": {"app": "web"}}
        }))
        .unwrap();

        let constraints = GenericAdapter.parse(&object, &widget_kind()).unwrap();
        let selector = constraints[0].workload_selector.as_ref().unwrap();
        assert_eq!(
            selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("app")
                .map(String::as_str),
            Some("web")
        );
    }

    #[test]
    fn cluster_scoped_resources_apply_everywhere() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "ClusterIssuer",
            "metadata": {"name": "letsencrypt"}
        }))
        .unwrap();

        let constraints = GenericAdapter
            .parse(&object, &HandledKind::new("cert-manager.io", "ClusterIssuer"))
            .unwrap();
        assert_eq!(constraints[0].scope, Scope::Cluster);
        assert_eq!(constraints[0].constraint_type, ConstraintType::CertIssuer);
    }
}
