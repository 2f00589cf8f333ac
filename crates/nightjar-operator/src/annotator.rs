//! Maintains the `nightjar.io/constraints` annotation on affected workloads.
//!
//! Consumes the indexer's callback channel, debounces per workload to avoid
//! API churn and reconciles the annotation against the current index state.
//! When the last constraint affecting a workload is retired the annotation
//! is cleared.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::Pod,
};
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use nightjar_core::{
    index::{ChangeEvent, ConstraintIndex},
    workload::{Workload, WorkloadKind, WorkloadRef},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    consts::ANNOTATION_CONSTRAINTS,
    shutdown::Shutdown,
    workloads::WorkloadCache,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
const FLUSH_TICK: Duration = Duration::from_secs(1);

pub struct Annotator {
    client: Client,
    index: Arc<ConstraintIndex>,
    cache: WorkloadCache,
    leader: watch::Receiver<bool>,
    debounce: Duration,

    /// Workloads whose annotation needs recomputing, with their flush
    /// deadline.
    dirty: HashMap<WorkloadRef, Instant>,
    /// Last value written per workload, to suppress no-op patches.
    applied: HashMap<WorkloadRef, Option<String>>,
}

impl Annotator {
    pub fn new(
        client: Client,
        index: Arc<ConstraintIndex>,
        cache: WorkloadCache,
        leader: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            index,
            cache,
            leader,
            debounce: DEFAULT_DEBOUNCE,
            dirty: HashMap::new(),
            applied: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ChangeEvent>, shutdown: Shutdown) {
        let mut stop = std::pin::pin!(shutdown.wait());
        let mut tick = tokio::time::interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leader_changes = self.leader.clone();

        loop {
            tokio::select! {
                () = &mut stop => {
                    info!("annotator shutting down");
                    return;
                }
                Some(event) = rx.recv() => self.mark_affected(&event),
                changed = leader_changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *leader_changes.borrow() {
                        // A fresh leader re-reconciles everything it knows.
                        self.applied.clear();
                        let deadline = Instant::now();
                        for workload in self.cache.all() {
                            self.dirty.insert(target_of(&workload), deadline);
                        }
                    }
                }
                _ = tick.tick() => self.flush_due().await,
            }
        }
    }

    /// Marks every workload the changed constraint touches. Pods attribute
    /// to their controller, which carries the annotation.
    fn mark_affected(&mut self, event: &ChangeEvent) {
        let constraint = event.constraint();
        let deadline = Instant::now() + self.debounce;
        for workload in self.cache.all() {
            if constraint.selects(&workload.id.namespace, &workload.labels) {
                self.dirty
                    .entry(target_of(&workload))
                    .or_insert(deadline);
            }
        }
    }

    async fn flush_due(&mut self) {
        if !*self.leader.borrow() {
            return;
        }
        let now = Instant::now();
        let due: Vec<WorkloadRef> = self
            .dirty
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            self.dirty.remove(&id);
            let Some(workload) = self.cache.get(&id) else {
                // Deleted workloads take their annotations with them.
                self.applied.remove(&id);
                continue;
            };

            let value = desired_value(&self.index, &workload);
            if self.applied.get(&id) == Some(&value) {
                continue;
            }

            match patch_annotation(&self.client, &id, value.as_deref()).await {
                Ok(()) => {
                    debug!(workload = %id, value = ?value, "updated constraint annotation");
                    self.applied.insert(id, value);
                }
                Err(error) => {
                    // Transient; the workload stays dirty and retries on the
                    // next tick.
                    warn!(workload = %id, %error, "failed to patch annotation");
                    self.dirty.insert(id, now + self.debounce);
                }
            }
        }
    }
}

fn target_of(workload: &Workload) -> WorkloadRef {
    workload.controller().clone()
}

/// The annotation value a workload should carry right now: the sorted,
/// comma-separated names of every constraint affecting it, or nothing.
fn desired_value(index: &ConstraintIndex, workload: &Workload) -> Option<String> {
    let names: BTreeSet<String> = index
        .query_by_workload(&workload.id.namespace, &workload.labels)
        .into_iter()
        .map(|constraint| constraint.name)
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.into_iter().collect::<Vec<_>>().join(","))
    }
}

/// Merge-patches the annotation onto the workload; `None` removes it.
async fn patch_annotation(
    client: &Client,
    id: &WorkloadRef,
    value: Option<&str>,
) -> kube::Result<()> {
    let patch = serde_json::json!({
        "metadata": {"annotations": {ANNOTATION_CONSTRAINTS: value}}
    });
    let params = PatchParams::default();
    let patch = Patch::Merge(&patch);

    match id.kind {
        WorkloadKind::Deployment => {
            Api::<Deployment>::namespaced(client.clone(), &id.namespace)
                .patch(&id.name, &params, &patch)
                .await?;
        }
        WorkloadKind::StatefulSet => {
            Api::<StatefulSet>::namespaced(client.clone(), &id.namespace)
                .patch(&id.name, &params, &patch)
                .await?;
        }
        WorkloadKind::DaemonSet => {
            Api::<DaemonSet>::namespaced(client.clone(), &id.namespace)
                .patch(&id.name, &params, &patch)
                .await?;
        }
        WorkloadKind::Job => {
            Api::<Job>::namespaced(client.clone(), &id.namespace)
                .patch(&id.name, &params, &patch)
                .await?;
        }
        WorkloadKind::Pod => {
            Api::<Pod>::namespaced(client.clone(), &id.namespace)
                .patch(&id.name, &params, &patch)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jiff::Timestamp;
    use nightjar_core::constraint::{
        Constraint, ConstraintType, Effect, Scope, Severity, SourceRef,
    };

    use super::*;

    fn constraint(name: &str) -> Constraint {
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
            severity: Severity::Critical,
            effect: Effect::Deny,
            workload_selector: None,
            scope: Scope::Namespace,
            summary: "restricted".to_string(),
            details: BTreeMap::new(),
            tags: Vec::new(),
            last_observed: Timestamp::UNIX_EPOCH,
            adapter: "network-policy".to_string(),
            resource_version: Some("1".to_string()),
        }
    }

    fn workload() -> Workload {
        Workload {
            id: WorkloadRef {
                kind: WorkloadKind::Deployment,
                namespace: "demo".to_string(),
                name: "web".to_string(),
            },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
        }
    }

    #[test]
    fn desired_value_lists_names_sorted_and_comma_separated() {
        let index = ConstraintIndex::new();
        let b = constraint("b-policy");
        let a = constraint("a-policy");
        index.upsert(&b.source.clone(), vec![b]);
        index.upsert(&a.source.clone(), vec![a]);

        assert_eq!(
            desired_value(&index, &workload()),
            Some("a-policy,b-policy".to_string())
        );
    }

    #[test]
    fn desired_value_clears_when_nothing_applies() {
        let index = ConstraintIndex::new();
        assert_eq!(desired_value(&index, &workload()), None);
    }

    #[test]
    fn retired_constraints_drop_out_of_the_value() {
        let index = ConstraintIndex::new();
        let c = constraint("restrict-egress");
        let source = c.source.clone();
        index.upsert(&source, vec![c]);
        assert_eq!(
            desired_value(&index, &workload()),
            Some("restrict-egress".to_string())
        );

        index.delete(&source);
        assert_eq!(desired_value(&index, &workload()), None);
    }
}
