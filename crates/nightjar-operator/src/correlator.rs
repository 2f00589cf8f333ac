//! Correlates constraints with live workloads.
//!
//! A single cooperative loop consumes index events, workload events and
//! (optionally) flow drops, maintains the current (workload, constraint)
//! pair set and emits notifications for newly affected or changed pairs.
//! The loop is serialized so the pair set stays coherent; the final pair set
//! is a pure function of index and cache state, independent of event
//! interleaving.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use nightjar_core::{
    constraint::{Constraint, ConstraintId, ConstraintType},
    index::{ChangeEvent, ConstraintIndex},
    notify::{DetailLevel, FlowDropNotification, Notification},
    selector::LabelSelectorExt,
    workload::{Workload, WorkloadKind, WorkloadRef},
};
use nightjar_hubble::FlowDrop;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace};

use crate::{
    metrics::Metrics,
    shutdown::Shutdown,
    workloads::{WorkloadCache, WorkloadEvent},
};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(15 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct CorrelatorChannels {
    pub index_rx: broadcast::Receiver<ChangeEvent>,
    pub workload_rx: mpsc::Receiver<WorkloadEvent>,
    pub flow_rx: mpsc::Receiver<FlowDrop>,
    pub notify_tx: mpsc::Sender<Notification>,
    pub flow_notify_tx: mpsc::Sender<FlowDropNotification>,
    /// Touched on every loop iteration; feeds the liveness probe.
    pub heartbeat: watch::Sender<Instant>,
}

pub struct Correlator {
    index: Arc<ConstraintIndex>,
    cache: WorkloadCache,
    detail_level: DetailLevel,
    dedup_window: Duration,
    metrics: Metrics,

    /// Current affected pairs, keyed by workload for cheap retraction.
    pairs: HashMap<WorkloadRef, HashSet<ConstraintId>>,
    /// Recently notified idempotency keys with their emission time.
    recently_notified: HashMap<String, Instant>,
}

impl Correlator {
    pub fn new(
        index: Arc<ConstraintIndex>,
        cache: WorkloadCache,
        detail_level: DetailLevel,
        metrics: Metrics,
    ) -> Self {
        Self {
            index,
            cache,
            detail_level,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            metrics,
            pairs: HashMap::new(),
            recently_notified: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub async fn run(mut self, mut channels: CorrelatorChannels, shutdown: Shutdown) {
        let mut stop = std::pin::pin!(shutdown.wait());
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = &mut stop => {
                    info!("correlator shutting down");
                    return;
                }
                event = channels.index_rx.recv() => match event {
                    Ok(event) => self.on_index_event(event, &channels.notify_tx).await,
                    Err(broadcast::error::RecvError::Lagged(lost)) => {
                        self.metrics.subscriber_lost_events.inc_by(lost);
                        debug!(lost, "index events lost, resyncing pair set");
                        self.resync(&channels.notify_tx).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                Some(event) = channels.workload_rx.recv() => {
                    self.on_workload_event(event, &channels.notify_tx).await;
                }
                Some(drop) = channels.flow_rx.recv() => {
                    self.on_flow_drop(drop, &channels.flow_notify_tx).await;
                }
                _ = sweep.tick() => self.sweep_dedup(),
            }

            channels.heartbeat.send_replace(Instant::now());
        }
    }

    async fn on_index_event(&mut self, event: ChangeEvent, tx: &mpsc::Sender<Notification>) {
        match event {
            ChangeEvent::Added(constraint) => {
                for workload in self.cache.all() {
                    if applies(&constraint, &workload) {
                        self.add_pair(&constraint, &workload, tx).await;
                    }
                }
            }
            ChangeEvent::Updated(constraint) => {
                let id = constraint.id();
                for workload in self.cache.all() {
                    if applies(&constraint, &workload) {
                        // A changed payload renotifies even existing pairs.
                        self.pairs
                            .entry(workload.id.clone())
                            .or_default()
                            .insert(id.clone());
                        self.notify(&constraint, &workload, tx).await;
                    } else if let Some(set) = self.pairs.get_mut(&workload.id) {
                        // The selector may have stopped matching.
                        set.remove(&id);
                    }
                }
            }
            ChangeEvent::Removed(constraint) => {
                let id = constraint.id();
                self.pairs.retain(|_, set| {
                    set.remove(&id);
                    !set.is_empty()
                });
            }
        }
    }

    async fn on_workload_event(&mut self, event: WorkloadEvent, tx: &mpsc::Sender<Notification>) {
        match event {
            WorkloadEvent::Upserted(workload) => {
                self.correlate_workload(&workload, tx).await;
            }
            WorkloadEvent::Removed(id) => {
                self.pairs.remove(&id);
            }
            WorkloadEvent::Resynced => self.resync(tx).await,
        }
    }

    /// Recomputes the pair set for one workload against the index.
    async fn correlate_workload(&mut self, workload: &Workload, tx: &mpsc::Sender<Notification>) {
        let matched = self
            .index
            .query_by_workload(&workload.id.namespace, &workload.labels);
        let matched_ids: HashSet<ConstraintId> = matched.iter().map(Constraint::id).collect();
        let previous = self.pairs.remove(&workload.id).unwrap_or_default();

        for constraint in &matched {
            if !previous.contains(&constraint.id()) {
                self.notify(constraint, workload, tx).await;
            }
        }

        if matched_ids.is_empty() {
            trace!(workload = %workload.id, "workload has no affecting constraints");
        } else {
            self.pairs.insert(workload.id.clone(), matched_ids);
        }
    }

    /// Rebuilds the whole pair set from cache and index, emitting only for
    /// pairs that were not known before. Used after subscriber loss and
    /// watch re-lists.
    async fn resync(&mut self, tx: &mpsc::Sender<Notification>) {
        for workload in self.cache.all() {
            self.correlate_workload(&workload, tx).await;
        }
        // Workloads that vanished entirely while events were lost.
        let live = self.cache.refs();
        self.pairs.retain(|id, _| live.contains(id));
    }

    async fn add_pair(
        &mut self,
        constraint: &Constraint,
        workload: &Workload,
        tx: &mpsc::Sender<Notification>,
    ) {
        let inserted = self
            .pairs
            .entry(workload.id.clone())
            .or_default()
            .insert(constraint.id());
        if inserted {
            self.notify(constraint, workload, tx).await;
        }
    }

    /// Emits a notification for the pair unless one went out within the
    /// dedup window. Notifications target the owning controller, so the
    /// pods of one Deployment collapse into a single key.
    async fn notify(
        &mut self,
        constraint: &Constraint,
        workload: &Workload,
        tx: &mpsc::Sender<Notification>,
    ) {
        let target = workload.controller().clone();
        let notification = Notification::render(constraint, &target, self.detail_level);

        let key = notification.idempotency_key();
        let now = Instant::now();
        match self.recently_notified.get(&key) {
            Some(at) if now.duration_since(*at) < self.dedup_window => return,
            _ => {
                self.recently_notified.insert(key, now);
            }
        }

        let _ = tx.send(notification).await;
    }

    fn sweep_dedup(&mut self) {
        let window = self.dedup_window;
        self.recently_notified
            .retain(|_, at| at.elapsed() < window);
    }

    /// Attributes an observed drop to the single most specific network
    /// constraint affecting either endpoint; unattributable drops are only
    /// counted.
    async fn on_flow_drop(&mut self, drop: FlowDrop, tx: &mpsc::Sender<FlowDropNotification>) {
        let Some(constraint) = self.attribute(&drop) else {
            self.metrics.flow_drops_unattributed.inc();
            return;
        };
        self.metrics.flow_drops_attributed.inc();

        let notification = FlowDropNotification {
            source_pod: pod_ref(&drop.source.namespace, &drop.source.pod),
            dest_pod: pod_ref(&drop.destination.namespace, &drop.destination.pod),
            dest_port: drop.dest_port,
            protocol: drop.protocol.clone(),
            reason: drop.reason.clone(),
            constraint: constraint.id(),
        };
        let _ = tx.send(notification).await;
    }

    fn attribute(&self, drop: &FlowDrop) -> Option<Constraint> {
        // Prefer cached pod labels; fall back to the labels the flow record
        // carries for pods the informer has not seen.
        let source_labels = self
            .cache
            .find_pod(&drop.source.namespace, &drop.source.pod)
            .map_or_else(|| drop.source.labels.clone(), |w| w.labels);
        let dest_labels = self
            .cache
            .find_pod(&drop.destination.namespace, &drop.destination.pod)
            .map_or_else(|| drop.destination.labels.clone(), |w| w.labels);

        let mut candidates: Vec<Constraint> = self
            .index
            .query_by_workload(&drop.source.namespace, &source_labels)
            .into_iter()
            .filter(|c| c.constraint_type == ConstraintType::NetworkEgress)
            .chain(
                self.index
                    .query_by_workload(&drop.destination.namespace, &dest_labels)
                    .into_iter()
                    .filter(|c| c.constraint_type == ConstraintType::NetworkIngress),
            )
            .collect();

        // Most specific selector wins; a constraint without a selector is
        // the least plausible explanation. Name order breaks ties so
        // attribution is deterministic.
        candidates.sort_by(|a, b| {
            specificity(b)
                .cmp(&specificity(a))
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates.into_iter().next()
    }
}

fn applies(constraint: &Constraint, workload: &Workload) -> bool {
    constraint.selects(&workload.id.namespace, &workload.labels)
}

fn specificity(constraint: &Constraint) -> usize {
    constraint
        .workload_selector
        .as_ref()
        // Present-but-empty selectors still beat absent ones.
        .map_or(0, |selector| selector.specificity() + 1)
}

fn pod_ref(namespace: &str, name: &str) -> WorkloadRef {
    WorkloadRef {
        kind: WorkloadKind::Pod,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jiff::Timestamp;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use nightjar_core::constraint::{Effect, Scope, Severity, SourceRef};
    use nightjar_hubble::FlowEndpoint;

    use super::*;

    fn constraint(name: &str, selector: Option<LabelSelector>) -> Constraint {
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
            workload_selector: selector,
            scope: Scope::Namespace,
            summary: "egress restricted".to_string(),
            details: BTreeMap::new(),
            tags: Vec::new(),
            last_observed: Timestamp::UNIX_EPOCH,
            adapter: "network-policy".to_string(),
            resource_version: Some("1".to_string()),
        }
    }

    fn selector(labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..LabelSelector::default()
        }
    }

    fn deployment(name: &str, labels: &[(&str, &str)]) -> Workload {
        Workload {
            id: WorkloadRef {
                kind: WorkloadKind::Deployment,
                namespace: "demo".to_string(),
                name: name.to_string(),
            },
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
            owner: None,
        }
    }

    fn correlator(index: Arc<ConstraintIndex>, cache: WorkloadCache) -> Correlator {
        Correlator::new(index, cache, DetailLevel::Detailed, Metrics::default())
    }

    #[tokio::test]
    async fn new_constraints_notify_matching_workloads() {
        let index = Arc::new(ConstraintIndex::new());
        let cache = WorkloadCache::default();
        cache.upsert(deployment("web", &[("app", "web")]));
        cache.upsert(deployment("db", &[("app", "db")]));
        let mut correlator = correlator(Arc::clone(&index), cache);
        let (tx, mut rx) = mpsc::channel(8);

        let c = constraint("restrict-egress", Some(selector(&[("app", "web")])));
        correlator
            .on_index_event(ChangeEvent::Added(c), &tx)
            .await;

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.workload.name, "web");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn workload_arrival_picks_up_existing_constraints() {
        let index = Arc::new(ConstraintIndex::new());
        let c = constraint("restrict-egress", None);
        index.upsert(&c.source.clone(), vec![c]);
        let cache = WorkloadCache::default();
        let web = deployment("web", &[("app", "web")]);
        cache.upsert(web.clone());
        let mut correlator = correlator(index, cache);
        let (tx, mut rx) = mpsc::channel(8);

        correlator
            .on_workload_event(WorkloadEvent::Upserted(web), &tx)
            .await;

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.constraint.name, "restrict-egress");
    }

    #[tokio::test]
    async fn repeated_pairs_are_deduplicated_within_the_window() {
        let index = Arc::new(ConstraintIndex::new());
        let c = constraint("restrict-egress", None);
        index.upsert(&c.source.clone(), vec![c]);
        let cache = WorkloadCache::default();
        let web = deployment("web", &[("app", "web")]);
        cache.upsert(web.clone());
        let mut correlator = correlator(index, cache);
        let (tx, mut rx) = mpsc::channel(8);

        // A flapping selector re-delivers the same pair repeatedly.
        for _ in 0..3 {
            correlator
                .on_workload_event(WorkloadEvent::Upserted(web.clone()), &tx)
                .await;
            correlator
                .on_workload_event(WorkloadEvent::Removed(web.id.clone()), &tx)
                .await;
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_dedup_entries_allow_renotification() {
        let index = Arc::new(ConstraintIndex::new());
        let c = constraint("restrict-egress", None);
        index.upsert(&c.source.clone(), vec![c]);
        let cache = WorkloadCache::default();
        let web = deployment("web", &[("app", "web")]);
        cache.upsert(web.clone());
        let mut correlator =
            correlator(index, cache).with_dedup_window(Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(8);

        correlator
            .on_workload_event(WorkloadEvent::Upserted(web.clone()), &tx)
            .await;
        correlator
            .on_workload_event(WorkloadEvent::Removed(web.id.clone()), &tx)
            .await;
        correlator
            .on_workload_event(WorkloadEvent::Upserted(web), &tx)
            .await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn retracted_constraints_leave_the_pair_set() {
        let index = Arc::new(ConstraintIndex::new());
        let cache = WorkloadCache::default();
        let web = deployment("web", &[("app", "web")]);
        cache.upsert(web.clone());
        let mut correlator = correlator(Arc::clone(&index), cache);
        let (tx, mut rx) = mpsc::channel(8);

        let c = constraint("restrict-egress", None);
        correlator
            .on_index_event(ChangeEvent::Added(c.clone()), &tx)
            .await;
        rx.try_recv().unwrap();

        correlator
            .on_index_event(ChangeEvent::Removed(c), &tx)
            .await;
        assert!(correlator.pairs.is_empty());
    }

    #[tokio::test]
    async fn pair_set_is_independent_of_event_interleaving() {
        let index = Arc::new(ConstraintIndex::new());
        let c = constraint("restrict-egress", Some(selector(&[("app", "web")])));
        index.upsert(&c.source.clone(), vec![c.clone()]);
        let web = deployment("web", &[("app", "web")]);
        let (tx, _rx) = mpsc::channel(64);

        // Constraint first, workload second.
        let mut first = correlator(Arc::clone(&index), {
            let cache = WorkloadCache::default();
            cache.upsert(web.clone());
            cache
        });
        first.on_index_event(ChangeEvent::Added(c.clone()), &tx).await;
        first
            .on_workload_event(WorkloadEvent::Upserted(web.clone()), &tx)
            .await;

        // Workload first, constraint second.
        let mut second = correlator(Arc::clone(&index), {
            let cache = WorkloadCache::default();
            cache.upsert(web.clone());
            cache
        });
        second
            .on_workload_event(WorkloadEvent::Upserted(web.clone()), &tx)
            .await;
        second.on_index_event(ChangeEvent::Added(c), &tx).await;

        assert_eq!(first.pairs, second.pairs);
    }

    #[tokio::test]
    async fn flow_drops_attribute_to_the_most_specific_constraint() {
        let index = Arc::new(ConstraintIndex::new());
        let broad = constraint("allow-all-watcher", Some(selector(&[])));
        let specific = constraint("restrict-egress", Some(selector(&[("app", "web")])));
        index.upsert(&broad.source.clone(), vec![broad]);
        index.upsert(&specific.source.clone(), vec![specific]);

        let cache = WorkloadCache::default();
        let mut correlator = correlator(index, cache);
        let (tx, mut rx) = mpsc::channel(8);

        let drop = FlowDrop {
            source: FlowEndpoint {
                namespace: "demo".to_string(),
                pod: "web-abc".to_string(),
                labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
            },
            destination: FlowEndpoint {
                namespace: "demo".to_string(),
                pod: "db-0".to_string(),
                labels: [("app".to_string(), "db".to_string())].into_iter().collect(),
            },
            dest_port: 5432,
            protocol: "TCP".to_string(),
            reason: "POLICY_DENIED".to_string(),
        };
        correlator.on_flow_drop(drop, &tx).await;

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.constraint.name, "restrict-egress");
        assert_eq!(notification.dest_port, 5432);
        assert_eq!(notification.source_pod.name, "web-abc");
    }

    #[tokio::test]
    async fn unattributable_drops_are_only_counted() {
        let index = Arc::new(ConstraintIndex::new());
        let metrics = Metrics::default();
        let mut correlator = Correlator::new(
            index,
            WorkloadCache::default(),
            DetailLevel::Summary,
            metrics.clone(),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let drop = FlowDrop {
            source: FlowEndpoint {
                namespace: "demo".to_string(),
                pod: "web-abc".to_string(),
                labels: BTreeMap::new(),
            },
            destination: FlowEndpoint::default(),
            dest_port: 443,
            protocol: "TCP".to_string(),
            reason: "POLICY_DENIED".to_string(),
        };
        correlator.on_flow_drop(drop, &tx).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.flow_drops_unattributed.get(), 1);
    }
}
