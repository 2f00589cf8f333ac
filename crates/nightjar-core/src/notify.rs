//! Developer-facing notification records and their privacy-controlled
//! rendering.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    constraint::{Constraint, ConstraintId, ConstraintType, Severity},
    workload::WorkloadRef,
};

/// How much a notification message reveals.
///
/// `Summary` is the default and leaks nothing but classification. `Detailed`
/// names the constraint and in-namespace sources. `Full` additionally
/// reveals cross-namespace source names and exact port numbers.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    #[default]
    Summary,
    Detailed,
    Full,
}

/// One "constraint X affects workload Y" message, ready for dispatch.
#[derive(Clone, Debug)]
pub struct Notification {
    pub workload: WorkloadRef,
    pub constraint: ConstraintId,
    pub constraint_type: ConstraintType,
    pub severity: Severity,
    pub source_kind: String,
    pub detail_level: DetailLevel,
    pub message: String,
}

impl Notification {
    pub fn render(constraint: &Constraint, workload: &WorkloadRef, level: DetailLevel) -> Self {
        Self {
            workload: workload.clone(),
            constraint: constraint.id(),
            constraint_type: constraint.constraint_type,
            severity: constraint.severity,
            source_kind: constraint.source.kind.clone(),
            detail_level: level,
            message: render_message(constraint, workload, level),
        }
    }

    /// Key for rate limiting and deduplication of repeated notifications for
    /// the same (workload, constraint) pair.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{workload}|{source}|{id}",
            workload = self.workload,
            source = self.constraint.source,
            id = self.constraint
        )
    }
}

fn render_message(constraint: &Constraint, workload: &WorkloadRef, level: DetailLevel) -> String {
    match level {
        DetailLevel::Summary => format!(
            "a {severity} {constraint_type} constraint affects this workload",
            severity = constraint.severity,
            constraint_type = constraint.constraint_type,
        ),
        DetailLevel::Detailed => {
            let mut message = format!(
                "constraint {name} ({constraint_type}, {severity}) affects this workload",
                name = constraint.name,
                constraint_type = constraint.constraint_type,
                severity = constraint.severity,
            );
            // Only sources living in the workload's own namespace are named
            // at this level.
            if constraint.source.namespace.as_deref() == Some(workload.namespace.as_str()) {
                message.push_str(&format!(
                    ", from {kind} {source_name}",
                    kind = constraint.source.kind,
                    source_name = constraint.source.name,
                ));
            }
            message
        }
        DetailLevel::Full => {
            let source = &constraint.source;
            let origin = match &source.namespace {
                Some(namespace) => format!("{kind} {namespace}/{name}", kind = source.kind, name = source.name),
                None => format!("cluster-scoped {kind} {name}", kind = source.kind, name = source.name),
            };
            let mut message = format!(
                "constraint {name} ({constraint_type}, {severity}) affects this workload, from {origin}: {summary}",
                name = constraint.name,
                constraint_type = constraint.constraint_type,
                severity = constraint.severity,
                summary = constraint.summary,
            );
            if let Some(ports) = constraint.details.get("allowedPorts") {
                message.push_str(&format!(" (allowed ports: {ports})"));
            }
            message
        }
    }
}

/// A network drop observed in live traffic, attributed to a constraint.
#[derive(Clone, Debug)]
pub struct FlowDropNotification {
    pub source_pod: WorkloadRef,
    pub dest_pod: WorkloadRef,
    pub dest_port: u16,
    pub protocol: String,
    pub reason: String,
    pub constraint: ConstraintId,
}

impl FlowDropNotification {
    pub fn message(&self, level: DetailLevel) -> String {
        match level {
            DetailLevel::Summary => {
                "observed network traffic dropped by a network constraint".to_string()
            }
            DetailLevel::Detailed => format!(
                "traffic from {source} to {dest} was dropped by constraint {constraint}",
                source = self.source_pod.name,
                dest = self.dest_pod.name,
                constraint = self.constraint.name,
            ),
            DetailLevel::Full => format!(
                "traffic from {source} to {dest} port {port}/{protocol} was dropped by \
                 constraint {constraint} ({reason})",
                source = self.source_pod,
                dest = self.dest_pod,
                port = self.dest_port,
                protocol = self.protocol,
                constraint = self.constraint.name,
                reason = self.reason,
            ),
        }
    }
}
