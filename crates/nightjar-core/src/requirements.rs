//! Rules that synthesize "missing prerequisite" constraints.
//!
//! A requirement rule fires when a workload looks like it needs some
//! supporting resource (a ServiceMonitor, Istio routing, a certificate
//! issuer) and the index holds no constraint proving that resource exists.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity, SourceRef},
    index::ConstraintIndex,
    workload::{Workload, WorkloadRef},
};

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(120);

/// One prerequisite rule.
pub trait RequirementRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this workload is expected to have the prerequisite at all.
    fn triggers(&self, workload: &Workload) -> bool;

    /// Whether an indexed constraint proves the prerequisite is present.
    /// Only constraints already scoped to the workload are offered.
    fn is_satisfied_by(&self, constraint: &Constraint) -> bool;

    fn constraint_type(&self) -> ConstraintType;

    fn summary(&self) -> String;
}

/// How evaluation interacts with the per-(workload, rule) debounce.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvalMode {
    /// Bypass the debounce. Used by synchronous pre-check queries (the
    /// admission side channel), which must always see the current answer.
    Immediate,
    /// Reuse the previous verdict within the batch window, so that periodic
    /// consumers (the report reconciler) see a stable answer that changes at
    /// most once per window.
    Batched,
}

type Verdicts = HashMap<(WorkloadRef, &'static str), (Instant, Option<Constraint>)>;

pub struct Evaluator {
    index: Arc<ConstraintIndex>,
    rules: Vec<Arc<dyn RequirementRule>>,
    batch_window: Duration,
    verdicts: Mutex<Verdicts>,
}

impl Evaluator {
    pub fn new(index: Arc<ConstraintIndex>) -> Self {
        Self::with_rules(index, default_rules(), DEFAULT_BATCH_WINDOW)
    }

    pub fn with_rules(
        index: Arc<ConstraintIndex>,
        rules: Vec<Arc<dyn RequirementRule>>,
        batch_window: Duration,
    ) -> Self {
        Self {
            index,
            rules,
            batch_window,
            verdicts: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates every rule against one workload, returning the synthesized
    /// constraints for unmet prerequisites.
    pub fn evaluate(&self, workload: &Workload, mode: EvalMode) -> Vec<Constraint> {
        let in_scope = self
            .index
            .query_by_workload(&workload.id.namespace, &workload.labels);

        let mut synthesized = Vec::new();
        for rule in &self.rules {
            if !rule.triggers(workload) {
                continue;
            }

            if mode == EvalMode::Batched {
                if let Some(cached) = self.cached_verdict(workload, rule.name()) {
                    synthesized.extend(cached);
                    continue;
                }
            }

            let verdict = if in_scope.iter().any(|c| rule.is_satisfied_by(c)) {
                None
            } else {
                Some(synthesize(rule.as_ref(), workload))
            };
            self.store_verdict(workload, rule.name(), verdict.clone());
            synthesized.extend(verdict);
        }
        synthesized
    }

    /// The stored verdict for the pair, if it is still within the batch
    /// window.
    fn cached_verdict(&self, workload: &Workload, rule: &'static str) -> Option<Option<Constraint>> {
        let verdicts = self.verdicts.lock().expect("evaluator lock poisoned");
        match verdicts.get(&(workload.id.clone(), rule)) {
            Some((at, verdict)) if at.elapsed() < self.batch_window => Some(verdict.clone()),
            _ => None,
        }
    }

    fn store_verdict(&self, workload: &Workload, rule: &'static str, verdict: Option<Constraint>) {
        let mut verdicts = self.verdicts.lock().expect("evaluator lock poisoned");
        verdicts.insert((workload.id.clone(), rule), (Instant::now(), verdict));
    }

    /// Drops debounce state for workloads that no longer exist. Called from
    /// a background cleanup loop.
    pub fn expire(&self, live: &HashSet<WorkloadRef>) {
        let mut verdicts = self.verdicts.lock().expect("evaluator lock poisoned");
        verdicts.retain(|(workload, _), _| live.contains(workload));
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

fn synthesize(rule: &dyn RequirementRule, workload: &Workload) -> Constraint {
    let namespace = workload.id.namespace.clone();
    let mut constraint = Constraint {
        source: SourceRef {
            api_version: "nightjar.io/v1".to_string(),
            kind: "Requirement".to_string(),
            namespace: Some(namespace.clone()),
            name: format!("{rule}-{workload}", rule = rule.name(), workload = workload.id.name),
        },
        name: format!("{rule}-{workload}", rule = rule.name(), workload = workload.id.name),
        namespace: Some(namespace),
        constraint_type: rule.constraint_type(),
        severity: Severity::Warning,
        effect: Effect::Require,
        workload_selector: None,
        scope: Scope::Namespace,
        summary: rule.summary(),
        details: [
            ("rule".to_string(), rule.name().to_string()),
            ("workload".to_string(), workload.id.to_string()),
        ]
        .into_iter()
        .collect(),
        tags: Vec::new(),
        last_observed: jiff::Timestamp::now(),
        adapter: "requirements".to_string(),
        resource_version: None,
    };
    constraint.push_tag("requirement");
    constraint
}

pub fn default_rules() -> Vec<Arc<dyn RequirementRule>> {
    vec![
        Arc::new(PrometheusMonitorRule),
        Arc::new(IstioRoutingRule),
        Arc::new(IstioMtlsRule),
        Arc::new(CertIssuerRule),
    ]
}

fn wants_istio(workload: &Workload) -> bool {
    workload
        .annotations
        .get("sidecar.istio.io/inject")
        .or_else(|| workload.labels.get("sidecar.istio.io/inject"))
        .is_some_and(|v| v == "true")
        || workload.labels.contains_key("istio.io/rev")
}

/// A workload that asks to be scraped needs a ServiceMonitor selecting it.
pub struct PrometheusMonitorRule;

impl RequirementRule for PrometheusMonitorRule {
    fn name(&self) -> &'static str {
        "PrometheusMonitor"
    }

    fn triggers(&self, workload: &Workload) -> bool {
        workload
            .annotations
            .get("prometheus.io/scrape")
            .is_some_and(|v| v == "true")
    }

    fn is_satisfied_by(&self, constraint: &Constraint) -> bool {
        constraint.constraint_type == ConstraintType::Monitoring
    }

    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Monitoring
    }

    fn summary(&self) -> String {
        "workload asks to be scraped but no monitoring rule selects it".to_string()
    }
}

/// A mesh-injected workload without routing configuration is unreachable
/// through the mesh.
pub struct IstioRoutingRule;

impl RequirementRule for IstioRoutingRule {
    fn name(&self) -> &'static str {
        "IstioRouting"
    }

    fn triggers(&self, workload: &Workload) -> bool {
        wants_istio(workload)
    }

    fn is_satisfied_by(&self, constraint: &Constraint) -> bool {
        constraint.constraint_type == ConstraintType::Mesh
            && constraint.source.kind == "VirtualService"
    }

    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Mesh
    }

    fn summary(&self) -> String {
        "mesh-injected workload has no VirtualService routing to it".to_string()
    }
}

pub struct IstioMtlsRule;

impl RequirementRule for IstioMtlsRule {
    fn name(&self) -> &'static str {
        "IstioMTLS"
    }

    fn triggers(&self, workload: &Workload) -> bool {
        wants_istio(workload)
    }

    fn is_satisfied_by(&self, constraint: &Constraint) -> bool {
        constraint.constraint_type == ConstraintType::Mesh
            && constraint.source.kind == "PeerAuthentication"
    }

    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Mesh
    }

    fn summary(&self) -> String {
        "mesh-injected workload has no PeerAuthentication policy".to_string()
    }
}

/// A workload that references a certificate issuer needs one to exist.
pub struct CertIssuerRule;

impl RequirementRule for CertIssuerRule {
    fn name(&self) -> &'static str {
        "CertIssuer"
    }

    fn triggers(&self, workload: &Workload) -> bool {
        workload
            .annotations
            .keys()
            .any(|k| k == "cert-manager.io/issuer" || k == "cert-manager.io/cluster-issuer")
    }

    fn is_satisfied_by(&self, constraint: &Constraint) -> bool {
        constraint.constraint_type == ConstraintType::CertIssuer
    }

    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::CertIssuer
    }

    fn summary(&self) -> String {
        "workload references a certificate issuer that does not exist".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::workload::WorkloadKind;

    fn scraped_workload() -> Workload {
        Workload {
            id: WorkloadRef {
                kind: WorkloadKind::Deployment,
                namespace: "demo".to_string(),
                name: "web".to_string(),
            },
            labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
            annotations: [("prometheus.io/scrape".to_string(), "true".to_string())]
                .into_iter()
                .collect(),
            owner: None,
        }
    }

    fn monitoring_constraint() -> Constraint {
        Constraint {
            source: SourceRef {
                api_version: "monitoring.coreos.com/v1".to_string(),
                kind: "ServiceMonitor".to_string(),
                namespace: Some("demo".to_string()),
                name: "web-monitor".to_string(),
            },
            name: "web-monitor".to_string(),
            namespace: Some("demo".to_string()),
            constraint_type: ConstraintType::Monitoring,
            severity: Severity::Info,
            effect: Effect::Audit,
            workload_selector: None,
            scope: Scope::Namespace,
            summary: "scraped".to_string(),
            details: BTreeMap::new(),
            tags: Vec::new(),
            last_observed: jiff::Timestamp::UNIX_EPOCH,
            adapter: "generic".to_string(),
            resource_version: Some("1".to_string()),
        }
    }

    #[test]
    fn unmet_prerequisite_synthesizes_a_constraint() {
        let index = Arc::new(ConstraintIndex::new());
        let evaluator = Evaluator::new(index);

        let synthesized = evaluator.evaluate(&scraped_workload(), EvalMode::Immediate);
        assert_eq!(synthesized.len(), 1);
        let c = &synthesized[0];
        assert_eq!(c.constraint_type, ConstraintType::Monitoring);
        assert_eq!(c.effect, Effect::Require);
        assert_eq!(c.details.get("rule").unwrap(), "PrometheusMonitor");
    }

    #[test]
    fn satisfied_prerequisite_stays_silent() {
        let index = Arc::new(ConstraintIndex::new());
        let monitor = monitoring_constraint();
        index.upsert(&monitor.source.clone(), vec![monitor]);
        let evaluator = Evaluator::new(index);

        assert!(
            evaluator
                .evaluate(&scraped_workload(), EvalMode::Immediate)
                .is_empty()
        );
    }

    #[test]
    fn untriggered_rules_never_fire() {
        let index = Arc::new(ConstraintIndex::new());
        let evaluator = Evaluator::new(index);
        let mut plain = scraped_workload();
        plain.annotations.clear();

        assert!(evaluator.evaluate(&plain, EvalMode::Immediate).is_empty());
    }

    #[test]
    fn batched_mode_reuses_the_verdict_within_the_window() {
        let index = Arc::new(ConstraintIndex::new());
        let evaluator = Evaluator::with_rules(
            Arc::clone(&index),
            default_rules(),
            Duration::from_secs(3600),
        );

        // Unmet on first evaluation; the verdict sticks for the window even
        // though the monitor shows up right afterwards.
        assert_eq!(
            evaluator.evaluate(&scraped_workload(), EvalMode::Batched).len(),
            1
        );
        let monitor = monitoring_constraint();
        index.upsert(&monitor.source.clone(), vec![monitor]);
        assert_eq!(
            evaluator.evaluate(&scraped_workload(), EvalMode::Batched).len(),
            1
        );

        // Immediate pre-checks always see the current answer and refresh the
        // stored verdict.
        assert!(
            evaluator
                .evaluate(&scraped_workload(), EvalMode::Immediate)
                .is_empty()
        );
        assert!(
            evaluator
                .evaluate(&scraped_workload(), EvalMode::Batched)
                .is_empty()
        );
    }

    #[test]
    fn expire_drops_state_for_dead_workloads() {
        let index = Arc::new(ConstraintIndex::new());
        let evaluator = Evaluator::with_rules(
            Arc::clone(&index),
            default_rules(),
            Duration::from_secs(3600),
        );
        let workload = scraped_workload();

        assert_eq!(evaluator.evaluate(&workload, EvalMode::Batched).len(), 1);
        let monitor = monitoring_constraint();
        index.upsert(&monitor.source.clone(), vec![monitor]);

        // The stale verdict would stick around, but expiring the workload's
        // state forces a fresh evaluation.
        evaluator.expire(&HashSet::new());
        assert!(evaluator.evaluate(&workload, EvalMode::Batched).is_empty());
    }
}
