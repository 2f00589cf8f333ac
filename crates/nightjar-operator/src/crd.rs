//! The ConstraintReport custom resource.
//!
//! One report per namespace, written by the report reconciler. The spec is
//! empty; the controller is the sole writer of `status`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use nightjar_core::constraint::Constraint;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const REPORT_NAME: &str = "nightjar";

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "nightjar.io",
    version = "v1",
    kind = "ConstraintReport",
    plural = "constraintreports",
    shortname = "cnr",
    status = "ConstraintReportStatus",
    namespaced
)]
pub struct ConstraintReportSpec {}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintReportStatus {
    pub constraints: Vec<ReportedConstraint>,
    pub counts_by_severity: SeverityCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<Time>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedConstraint {
    pub name: String,
    pub constraint_type: String,
    pub severity: String,
    pub source_kind: String,
    pub summary: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCounts {
    pub critical: u32,
    pub warning: u32,
    pub info: u32,
}

/// Summarizes a set of constraints into report status, sorted by severity
/// first and name second so repeated reconciles produce identical output.
pub fn summarize(constraints: &[Constraint], last_reconciled: Time) -> ConstraintReportStatus {
    let mut reported: Vec<ReportedConstraint> = constraints
        .iter()
        .map(|constraint| ReportedConstraint {
            name: constraint.name.clone(),
            constraint_type: constraint.constraint_type.to_string(),
            severity: constraint.severity.to_string(),
            source_kind: constraint.source.kind.clone(),
            summary: constraint.summary.clone(),
        })
        .collect();
    reported.sort_by(|a, b| {
        severity_rank(&a.severity)
            .cmp(&severity_rank(&b.severity))
            .then_with(|| a.name.cmp(&b.name))
    });
    reported.dedup();

    let mut counts = SeverityCounts::default();
    for constraint in &reported {
        match constraint.severity.as_str() {
            "Critical" => counts.critical += 1,
            "Warning" => counts.warning += 1,
            _ => counts.info += 1,
        }
    }

    ConstraintReportStatus {
        constraints: reported,
        counts_by_severity: counts,
        last_reconciled: Some(last_reconciled),
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity {
        "Critical" => 0,
        "Warning" => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jiff::Timestamp;
    use k8s_openapi::chrono::Utc;
    use nightjar_core::constraint::{ConstraintType, Effect, Scope, Severity, SourceRef};

    use super::*;

    fn constraint(name: &str, severity: Severity) -> Constraint {
        Constraint {
            source: SourceRef {
                api_version: "networking.k8s.io/v1".to_string(),
                kind: "NetworkPolicy".to_string(),
                namespace: Some("demo".to_string()),
                name: name.to_string(),
            },
            name: name.to_string(),
            namespace: Some("demo".to_string()),
            constraint_type: ConstraintType::NetworkEgress,
            severity,
            effect: Effect::Deny,
            workload_selector: None,
            scope: Scope::Namespace,
            summary: "restricted".to_string(),
            details: BTreeMap::new(),
            tags: Vec::new(),
            last_observed: Timestamp::UNIX_EPOCH,
            adapter: "network-policy".to_string(),
            resource_version: None,
        }
    }

    #[test]
    fn summarize_orders_by_severity_then_name() {
        let status = summarize(
            &[
                constraint("zz-info", Severity::Info),
                constraint("b-critical", Severity::Critical),
                constraint("a-warning", Severity::Warning),
            ],
            Time(Utc::now()),
        );

        let names: Vec<&str> = status.constraints.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b-critical", "a-warning", "zz-info"]);
        assert_eq!(status.counts_by_severity.critical, 1);
        assert_eq!(status.counts_by_severity.warning, 1);
        assert_eq!(status.counts_by_severity.info, 1);
    }

    #[test]
    fn crd_is_namespaced_under_the_nightjar_group() {
        use kube::CustomResourceExt;
        let crd = ConstraintReport::crd();
        assert_eq!(crd.spec.group, "nightjar.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "ConstraintReport");
    }
}
