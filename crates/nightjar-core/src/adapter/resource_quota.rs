//! Adapters for `core/v1` ResourceQuota and LimitRange objects.
//!
//! Both apply to every workload in their namespace, so neither carries a
//! workload selector.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LimitRange, ResourceQuota};
use kube::core::DynamicObject;
use snafu::OptionExt;

use crate::{
    adapter::{Adapter, HandledKind, MissingFieldSnafu, ParseError, observed_now, source_ref, typed},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity},
};

pub struct ResourceQuotaAdapter;

impl Adapter for ResourceQuotaAdapter {
    fn name(&self) -> &'static str {
        "resource-quota"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![HandledKind::new("", "ResourceQuota")]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let quota: ResourceQuota = typed(object, "ResourceQuota")?;
        let spec = quota.spec.context(MissingFieldSnafu { field: "spec" })?;

        let hard = spec.hard.unwrap_or_default();
        let mut details: BTreeMap<String, String> = hard
            .iter()
            .map(|(resource, quantity)| (format!("hard.{resource}"), quantity.0.clone()))
            .collect();
        if let Some(scopes) = &spec.scopes {
            details.insert("scopes".to_string(), scopes.join(","));
        }

        let mut constraint = Constraint {
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            source,
            constraint_type: ConstraintType::ResourceQuota,
            severity: Severity::Warning,
            effect: Effect::Limit,
            workload_selector: None,
            scope: Scope::Namespace,
            summary: format!("namespace quota caps {} resource(s)", hard.len()),
            details,
            tags: Vec::new(),
            last_observed: observed_now(),
            adapter: "resource-quota".to_string(),
            resource_version: quota.metadata.resource_version,
        };
        constraint.push_tag("quota");
        Ok(vec![constraint])
    }
}

pub struct LimitRangeAdapter;

impl Adapter for LimitRangeAdapter {
    fn name(&self) -> &'static str {
        "limit-range"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![HandledKind::new("", "LimitRange")]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;
        let limit_range: LimitRange = typed(object, "LimitRange")?;
        let spec = limit_range
            .spec
            .context(MissingFieldSnafu { field: "spec" })?;

        let mut details = BTreeMap::new();
        for item in &spec.limits {
            if let Some(default) = &item.default {
                for (resource, quantity) in default {
                    details.insert(
                        format!("default.{}.{resource}", item.type_),
                        quantity.0.clone(),
                    );
                }
            }
            if let Some(max) = &item.max {
                for (resource, quantity) in max {
                    details.insert(format!("max.{}.{resource}", item.type_), quantity.0.clone());
                }
            }
        }

        let mut constraint = Constraint {
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            source,
            constraint_type: ConstraintType::ResourceLimit,
            severity: Severity::Info,
            effect: Effect::Limit,
            workload_selector: None,
            scope: Scope::Namespace,
            summary: format!(
                "limit range constrains {} limit type(s) in this namespace",
                spec.limits.len()
            ),
            details,
            tags: Vec::new(),
            last_observed: observed_now(),
            adapter: "limit-range".to_string(),
            resource_version: limit_range.metadata.resource_version,
        };
        constraint.push_tag("limits");
        Ok(vec![constraint])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn quota_yields_a_namespace_wide_constraint() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": {"name": "compute-quota", "namespace": "demo", "resourceVersion": "7"},
            "spec": {"hard": {"requests.cpu": "2", "limits.memory": "4Gi"}}
        }))
        .unwrap();

        let constraints = ResourceQuotaAdapter
            .parse(&object, &HandledKind::new("", "ResourceQuota"))
            .unwrap();
        assert_eq!(constraints.len(), 1);
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::ResourceQuota);
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.effect, Effect::Limit);
        assert!(c.workload_selector.is_none());
        assert_eq!(c.details.get("hard.requests.cpu").unwrap(), "2");
    }

    #[test]
    fn limit_range_collects_defaults_and_maxima() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "LimitRange",
            "metadata": {"name": "container-limits", "namespace": "demo"},
            "spec": {"limits": [{
                "type": "Container",
                "default": {"cpu": "500m"},
                "max": {"memory": "1Gi"}
            }]}
        }))
        .unwrap();

        let constraints = LimitRangeAdapter
            .parse(&object, &HandledKind::new("", "LimitRange"))
            .unwrap();
        let c = &constraints[0];
        assert_eq!(c.constraint_type, ConstraintType::ResourceLimit);
        assert_eq!(c.details.get("default.Container.cpu").unwrap(), "500m");
        assert_eq!(c.details.get("max.Container.memory").unwrap(), "1Gi");
    }
}
