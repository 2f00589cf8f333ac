//! The authoritative in-memory constraint store.
//!
//! The index is the single source of truth; every other subsystem holds only
//! a derived view. It is rebuilt from cluster state on startup and never
//! persisted.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use arc_swap::ArcSwapOption;
use tokio::sync::{broadcast, mpsc};

use crate::{
    constraint::{Constraint, ConstraintId, Scope, SourceRef},
    selector::LabelSelectorExt,
};

/// Capacity of each subscriber's event channel. A subscriber that falls more
/// than this many events behind observes `Lagged` and is expected to resync.
pub const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum ChangeEvent {
    Added(Constraint),
    Updated(Constraint),
    Removed(Constraint),
}

impl ChangeEvent {
    pub fn constraint(&self) -> &Constraint {
        match self {
            Self::Added(c) | Self::Updated(c) | Self::Removed(c) => c,
        }
    }
}

#[derive(Default)]
struct Store {
    constraints: HashMap<ConstraintId, Constraint>,
    by_source: HashMap<SourceRef, HashSet<ConstraintId>>,
    by_namespace: HashMap<String, HashSet<ConstraintId>>,
    cluster_scoped: HashSet<ConstraintId>,
    /// Best-effort numeric resource version per source, used to drop
    /// out-of-order re-observations.
    source_versions: HashMap<SourceRef, u64>,
}

impl Store {
    fn insert(&mut self, constraint: Constraint) {
        let id = constraint.id();
        match constraint.scope {
            Scope::Cluster => {
                self.cluster_scoped.insert(id.clone());
            }
            Scope::Namespace => {
                if let Some(namespace) = &constraint.namespace {
                    self.by_namespace
                        .entry(namespace.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }
        self.by_source
            .entry(id.source.clone())
            .or_default()
            .insert(id.clone());
        self.constraints.insert(id, constraint);
    }

    fn remove(&mut self, id: &ConstraintId) -> Option<Constraint> {
        let constraint = self.constraints.remove(id)?;
        self.cluster_scoped.remove(id);
        if let Some(namespace) = &constraint.namespace {
            if let Some(set) = self.by_namespace.get_mut(namespace) {
                set.remove(id);
                if set.is_empty() {
                    self.by_namespace.remove(namespace);
                }
            }
        }
        if let Some(set) = self.by_source.get_mut(&id.source) {
            set.remove(id);
            if set.is_empty() {
                self.by_source.remove(&id.source);
            }
        }
        Some(constraint)
    }
}

/// The multi-dimensional constraint index.
///
/// Writes (`upsert`, `delete`, `retire_kind`) take the exclusive lock and
/// publish their change events before the lock is released, so a reader that
/// queries the index and then drains the event channel sees a
/// prefix-consistent view. The index holds no subscriber references; events
/// are pulled through per-subscriber broadcast channels, and the annotator is
/// wired in through a callback slot set after construction.
pub struct ConstraintIndex {
    store: RwLock<Store>,
    events: broadcast::Sender<ChangeEvent>,
    annotator_sink: ArcSwapOption<mpsc::Sender<ChangeEvent>>,
}

impl Default for ConstraintIndex {
    fn default() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }
}

impl ConstraintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            store: RwLock::new(Store::default()),
            events,
            annotator_sink: ArcSwapOption::empty(),
        }
    }

    /// Subscribes to change events.
    ///
    /// The channel is bounded; a subscriber that cannot keep up loses the
    /// oldest events and receives a `Lagged(n)` error carrying the loss
    /// count, upon which it should resync from the index.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Wires in the annotator's event sink after construction.
    ///
    /// The slot keeps the index free of references to its consumers; events
    /// are delivered with `try_send` and silently dropped when the sink is
    /// full (the annotator re-reads the index on every flush anyway).
    pub fn set_annotator_sink(&self, sink: mpsc::Sender<ChangeEvent>) {
        self.annotator_sink.store(Some(Arc::new(sink)));
    }

    /// Replaces the set of constraints attributed to `source`.
    ///
    /// Emits one event per affected constraint identity: `Added` for new
    /// identities, `Updated` for identities whose payload changed, `Removed`
    /// for identities no longer produced. A re-observation with a lower
    /// numeric resource version than the stored one is dropped.
    pub fn upsert(&self, source: &SourceRef, constraints: Vec<Constraint>) {
        let mut store = self.store.write().expect("constraint index lock poisoned");

        let new_version = constraints
            .iter()
            .filter_map(Constraint::numeric_resource_version)
            .max();
        if let (Some(new), Some(stored)) = (new_version, store.source_versions.get(source)) {
            if new < *stored {
                tracing::debug!(%source, new, stored = *stored, "dropping stale re-observation");
                return;
            }
        }

        let previous: HashSet<ConstraintId> = store
            .by_source
            .get(source)
            .cloned()
            .unwrap_or_default();
        let incoming: HashSet<ConstraintId> = constraints.iter().map(Constraint::id).collect();

        let mut events = Vec::new();

        for id in previous.difference(&incoming) {
            if let Some(removed) = store.remove(id) {
                events.push(ChangeEvent::Removed(removed));
            }
        }

        for mut constraint in constraints {
            let id = constraint.id();
            match store.constraints.get(&id) {
                Some(existing) => {
                    // last_observed never goes backwards for an identity.
                    if constraint.last_observed < existing.last_observed {
                        constraint.last_observed = existing.last_observed;
                    }
                    let changed = !existing.payload_eq(&constraint);
                    let clone = constraint.clone();
                    store.insert(constraint);
                    if changed {
                        events.push(ChangeEvent::Updated(clone));
                    }
                }
                None => {
                    let clone = constraint.clone();
                    store.insert(constraint);
                    events.push(ChangeEvent::Added(clone));
                }
            }
        }

        if let Some(version) = new_version {
            store.source_versions.insert(source.clone(), version);
        }

        self.publish(events);
    }

    /// Retires every constraint attributed to `source`.
    pub fn delete(&self, source: &SourceRef) {
        let mut store = self.store.write().expect("constraint index lock poisoned");
        let ids: Vec<ConstraintId> = store
            .by_source
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut events = Vec::new();
        for id in &ids {
            if let Some(removed) = store.remove(id) {
                events.push(ChangeEvent::Removed(removed));
            }
        }
        store.source_versions.remove(source);

        self.publish(events);
    }

    /// Retires every constraint whose source belongs to a resource kind that
    /// no longer exists in the cluster (CRD uninstalled).
    pub fn retire_kind(&self, group: &str, kind: &str) {
        let sources: Vec<SourceRef> = {
            let store = self.store.read().expect("constraint index lock poisoned");
            store
                .by_source
                .keys()
                .filter(|source| source.kind == kind && source.group() == group)
                .cloned()
                .collect()
        };
        for source in sources {
            self.delete(&source);
        }
    }

    /// Retires sources of the given kind that are not in `live`. Used after
    /// a watch re-list to drop objects deleted while the watch was down.
    pub fn retain_sources(&self, group: &str, kind: &str, live: &HashSet<SourceRef>) {
        let stale: Vec<SourceRef> = {
            let store = self.store.read().expect("constraint index lock poisoned");
            store
                .by_source
                .keys()
                .filter(|source| {
                    source.kind == kind && source.group() == group && !live.contains(*source)
                })
                .cloned()
                .collect()
        };
        for source in stale {
            self.delete(&source);
        }
    }

    /// Namespace-scoped constraints of `namespace` plus every cluster-scoped
    /// constraint.
    pub fn query_by_namespace(&self, namespace: &str) -> Vec<Constraint> {
        let store = self.store.read().expect("constraint index lock poisoned");
        let namespaced = store
            .by_namespace
            .get(namespace)
            .into_iter()
            .flatten();
        namespaced
            .chain(store.cluster_scoped.iter())
            .filter_map(|id| store.constraints.get(id))
            .cloned()
            .collect()
    }

    /// Constraints in scope for `namespace` whose selector matches `labels`.
    ///
    /// A constraint without a selector targets every workload in scope. A
    /// selector that fails to evaluate never matches.
    pub fn query_by_workload(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<Constraint> {
        self.query_by_namespace(namespace)
            .into_iter()
            .filter(|constraint| match &constraint.workload_selector {
                None => true,
                Some(selector) => selector.matches(labels).unwrap_or_else(|error| {
                    tracing::debug!(
                        constraint = %constraint.id(),
                        %error,
                        "constraint selector does not evaluate"
                    );
                    false
                }),
            })
            .collect()
    }

    pub fn get(&self, id: &ConstraintId) -> Option<Constraint> {
        let store = self.store.read().expect("constraint index lock poisoned");
        store.constraints.get(id).cloned()
    }

    /// Every namespace that currently holds namespace-scoped constraints.
    pub fn namespaces(&self) -> Vec<String> {
        let store = self.store.read().expect("constraint index lock poisoned");
        store.by_namespace.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let store = self.store.read().expect("constraint index lock poisoned");
        store.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            if let Some(sink) = self.annotator_sink.load_full() {
                // Dropped events are recovered by the annotator's next flush.
                let _ = sink.try_send(event.clone());
            }
            // Send fails only when nobody subscribes, which is fine.
            let _ = self.events.send(event);
        }
    }
}
