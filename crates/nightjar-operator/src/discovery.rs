//! The dynamic discovery engine.
//!
//! Periodically re-enumerates the cluster's API surface, keeps one watch per
//! eligible resource kind running and pipes observed objects through the
//! adapter registry into the constraint index. Kinds whose CRD disappears
//! get their watch stopped and their constraints retired.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use kube::{
    Client,
    core::DynamicObject,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope, verbs},
    runtime::watcher,
};
use nightjar_core::{
    adapter::{Adapter, AdapterRegistry, HandledKind, ParseError},
    backoff::Backoff,
    constraint::SourceRef,
    index::ConstraintIndex,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{metrics::Metrics, namespace::WatchNamespace, shutdown::Shutdown};

/// API groups served by Kubernetes itself. Resources in these groups are
/// only watched when an adapter claims them explicitly; everything else is a
/// custom resource and qualifies for the generic fallback.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "metrics.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

fn is_custom_group(group: &str) -> bool {
    // Our own reports must not feed back into the index.
    group != "nightjar.io" && !BUILTIN_GROUPS.contains(&group)
}

/// Tracks initial-sync progress for the readiness probe: ready once the
/// first successful rescan completed and every watch it started has seen its
/// initial list. Readiness never regresses.
#[derive(Clone)]
pub struct SyncGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    pending_watches: AtomicUsize,
    first_scan_done: AtomicBool,
    ready_tx: watch::Sender<bool>,
}

impl SyncGate {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Self {
                inner: Arc::new(GateInner {
                    pending_watches: AtomicUsize::new(0),
                    first_scan_done: AtomicBool::new(false),
                    ready_tx,
                }),
            },
            ready_rx,
        )
    }

    fn watch_started(&self) {
        self.inner.pending_watches.fetch_add(1, Ordering::SeqCst);
    }

    fn watch_synced(&self) {
        self.inner.pending_watches.fetch_sub(1, Ordering::SeqCst);
        self.maybe_ready();
    }

    fn scan_complete(&self) {
        self.inner.first_scan_done.store(true, Ordering::SeqCst);
        self.maybe_ready();
    }

    fn maybe_ready(&self) {
        if self.inner.first_scan_done.load(Ordering::SeqCst)
            && self.inner.pending_watches.load(Ordering::SeqCst) == 0
        {
            self.inner.ready_tx.send_replace(true);
        }
    }
}

struct WatchHandle {
    stop: watch::Sender<bool>,
    kind: HandledKind,
}

pub struct DiscoveryEngine {
    client: Client,
    registry: Arc<AdapterRegistry>,
    index: Arc<ConstraintIndex>,
    watch_namespace: WatchNamespace,
    rescan_interval: Duration,
    metrics: Metrics,
    sync: SyncGate,
    shutdown: Shutdown,
}

impl DiscoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        registry: Arc<AdapterRegistry>,
        index: Arc<ConstraintIndex>,
        watch_namespace: WatchNamespace,
        rescan_interval: Duration,
        metrics: Metrics,
        sync: SyncGate,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            client,
            registry,
            index,
            watch_namespace,
            rescan_interval,
            metrics,
            sync,
            shutdown,
        }
    }

    /// Runs the rescan loop until shutdown.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.rescan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop = std::pin::pin!(self.shutdown.wait());
        let mut watches: HashMap<HandledKind, WatchHandle> = HashMap::new();

        loop {
            tokio::select! {
                () = &mut stop => break,
                _ = interval.tick() => {}
            }

            match Discovery::new(self.client.clone()).run().await {
                Ok(discovery) => {
                    self.reconcile_watches(&discovery, &mut watches);
                    self.sync.scan_complete();
                }
                Err(error) => {
                    // Transient; the next tick retries.
                    warn!(%error, "cluster API discovery failed");
                }
            }
        }

        info!("discovery engine shutting down, stopping watches");
        for handle in watches.into_values() {
            let _ = handle.stop.send(true);
        }
    }

    fn reconcile_watches(
        &self,
        discovery: &Discovery,
        watches: &mut HashMap<HandledKind, WatchHandle>,
    ) {
        let mut present: HashMap<HandledKind, (ApiResource, ApiCapabilities)> = HashMap::new();
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if !capabilities.supports_operation(verbs::WATCH) {
                    continue;
                }
                let kind = HandledKind::new(group.name(), resource.kind.clone());
                present.insert(kind, (resource, capabilities));
            }
        }

        // Watches for kinds that left the cluster are stopped and their
        // constraints tombstoned.
        let gone: Vec<HandledKind> = watches
            .keys()
            .filter(|kind| !present.contains_key(*kind))
            .cloned()
            .collect();
        for kind in gone {
            if let Some(handle) = watches.remove(&kind) {
                info!(%kind, "resource kind left the cluster, stopping watch");
                let _ = handle.stop.send(true);
                self.index.retire_kind(&handle.kind.group, &handle.kind.kind);
            }
        }

        for (kind, (resource, capabilities)) in present {
            if watches.contains_key(&kind) {
                continue;
            }
            let Some(adapter) = self.eligible_adapter(&kind) else {
                continue;
            };

            debug!(%kind, adapter = adapter.name(), "starting watch");
            let (stop_tx, stop_rx) = watch::channel(false);
            self.sync.watch_started();
            tokio::spawn(run_watch(WatchTask {
                api: self.watch_namespace.dynamic_api(
                    &self.client,
                    &resource,
                    matches!(capabilities.scope, Scope::Namespaced),
                ),
                resource,
                kind: kind.clone(),
                adapter,
                index: Arc::clone(&self.index),
                metrics: self.metrics.clone(),
                sync: self.sync.clone(),
                stop: stop_rx,
            }));
            watches.insert(
                kind.clone(),
                WatchHandle {
                    stop: stop_tx,
                    kind,
                },
            );
        }
    }

    /// Resolves the adapter a kind would be parsed with, or `None` when the
    /// kind is not watched at all. Specifically claimed kinds always win;
    /// unclaimed custom resources fall back to the generic adapter.
    fn eligible_adapter(&self, kind: &HandledKind) -> Option<Arc<dyn Adapter>> {
        if let Some(adapter) = self.registry.lookup_specific(kind) {
            return Some(adapter);
        }
        if is_custom_group(&kind.group) {
            return self.registry.lookup_by_kind(kind);
        }
        None
    }
}

struct WatchTask {
    api: kube::Api<DynamicObject>,
    resource: ApiResource,
    kind: HandledKind,
    adapter: Arc<dyn Adapter>,
    index: Arc<ConstraintIndex>,
    metrics: Metrics,
    sync: SyncGate,
    stop: watch::Receiver<bool>,
}

/// One long-lived watch over a single resource kind.
///
/// The watcher stream is an eventual-consistency sequence of list/apply/
/// delete events; failures re-establish the stream with full-jitter
/// exponential backoff. Stale constraints survive a downed watch until the
/// re-list proves their source gone.
async fn run_watch(mut task: WatchTask) {
    let mut stream = watcher(task.api.clone(), watcher::Config::default()).boxed();
    let mut backoff = Backoff::watch();
    let mut relisted: Option<HashSet<SourceRef>> = None;
    let mut initially_synced = false;

    loop {
        let item = tokio::select! {
            changed = task.stop.changed() => {
                if changed.is_err() || *task.stop.borrow() {
                    break;
                }
                continue;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                backoff.reset();
                handle_event(&mut task, event, &mut relisted, &mut initially_synced);
            }
            Some(Err(error)) => {
                let delay = backoff.next_delay();
                debug!(kind = %task.kind, %error, delay = ?delay, "watch failed, backing off");
                tokio::select! {
                    _ = task.stop.changed() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None => break,
        }
    }

    if !initially_synced {
        // Keep the readiness gate balanced for watches stopped before their
        // first list completed.
        task.sync.watch_synced();
    }
    debug!(kind = %task.kind, "watch stopped");
}

fn handle_event(
    task: &mut WatchTask,
    event: watcher::Event<DynamicObject>,
    relisted: &mut Option<HashSet<SourceRef>>,
    initially_synced: &mut bool,
) {
    match event {
        watcher::Event::Init => {
            *relisted = Some(HashSet::new());
        }
        watcher::Event::InitApply(object) => {
            if let Some(source) = upsert_object(task, &object) {
                if let Some(seen) = relisted {
                    seen.insert(source);
                }
            }
        }
        watcher::Event::InitDone => {
            if let Some(seen) = relisted.take() {
                // Objects deleted while the watch was down are only
                // tombstoned now that the full list proves their absence.
                task.index
                    .retain_sources(&task.kind.group, &task.kind.kind, &seen);
            }
            if !*initially_synced {
                *initially_synced = true;
                task.sync.watch_synced();
            }
        }
        watcher::Event::Apply(object) => {
            upsert_object(task, &object);
        }
        watcher::Event::Delete(object) => {
            if let Some(source) = source_of(&object, &task.resource) {
                task.index.delete(&source);
            }
        }
    }
}

/// Parses one observed object and reconciles the index. Returns the source
/// identity when the object was attributable.
fn upsert_object(task: &WatchTask, object: &DynamicObject) -> Option<SourceRef> {
    let source = source_of(object, &task.resource)?;
    match task.adapter.parse(object, &task.kind) {
        Ok(constraints) => {
            task.index.upsert(&source, constraints);
            Some(source)
        }
        Err(error) => {
            // The single event is dropped; the watch keeps running.
            if matches!(error, ParseError::InvalidClassification { .. }) {
                task.metrics.constraints_rejected.inc();
            } else {
                task.metrics.parse_errors.inc();
            }
            warn!(
                %source,
                adapter = task.adapter.name(),
                %error,
                "dropping unparseable object"
            );
            Some(source)
        }
    }
}

fn source_of(object: &DynamicObject, resource: &ApiResource) -> Option<SourceRef> {
    Some(SourceRef {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
        namespace: object.metadata.namespace.clone(),
        name: object.metadata.name.clone()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_groups_are_not_custom() {
        assert!(!is_custom_group(""));
        assert!(!is_custom_group("apps"));
        assert!(!is_custom_group("networking.k8s.io"));
    }

    #[test]
    fn crd_groups_are_custom_except_our_own() {
        assert!(is_custom_group("example.com"));
        assert!(is_custom_group("monitoring.coreos.com"));
        assert!(!is_custom_group("nightjar.io"));
    }

    #[test]
    fn sync_gate_requires_scan_and_all_watches() {
        let (gate, ready) = SyncGate::new();
        assert!(!*ready.borrow());

        gate.watch_started();
        gate.watch_started();
        gate.scan_complete();
        assert!(!*ready.borrow());

        gate.watch_synced();
        assert!(!*ready.borrow());
        gate.watch_synced();
        assert!(*ready.borrow());
    }

    #[test]
    fn sync_gate_never_regresses() {
        let (gate, ready) = SyncGate::new();
        gate.watch_started();
        gate.scan_complete();
        gate.watch_synced();
        assert!(*ready.borrow());

        // A later rescan starting a new watch must not flip readiness back.
        gate.watch_started();
        assert!(*ready.borrow());
    }
}
