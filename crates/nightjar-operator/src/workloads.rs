//! Workload informers and the shared workload cache.
//!
//! Watches the workload kinds the correlator cares about, projects them into
//! the minimal [`Workload`] record and keeps one shared cache that the
//! correlator, annotator and report reconciler read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::{StreamExt, stream};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::Pod,
};
use kube::{
    Client, Resource, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use nightjar_core::workload::{Workload, WorkloadKind, WorkloadRef, pod_owner};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{namespace::WatchNamespace, shutdown::Shutdown};

#[derive(Clone, Debug)]
pub enum WorkloadEvent {
    Upserted(Workload),
    Removed(WorkloadRef),
    /// A watch re-listed; derived state should be recomputed.
    Resynced,
}

#[derive(Clone, Default)]
pub struct WorkloadCache {
    inner: Arc<RwLock<HashMap<WorkloadRef, Workload>>>,
}

impl WorkloadCache {
    pub fn upsert(&self, workload: Workload) {
        let mut inner = self.inner.write().expect("workload cache lock poisoned");
        inner.insert(workload.id.clone(), workload);
    }

    pub fn remove(&self, id: &WorkloadRef) -> bool {
        let mut inner = self.inner.write().expect("workload cache lock poisoned");
        inner.remove(id).is_some()
    }

    pub fn get(&self, id: &WorkloadRef) -> Option<Workload> {
        let inner = self.inner.read().expect("workload cache lock poisoned");
        inner.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Workload> {
        let inner = self.inner.read().expect("workload cache lock poisoned");
        inner.values().cloned().collect()
    }

    pub fn in_namespace(&self, namespace: &str) -> Vec<Workload> {
        let inner = self.inner.read().expect("workload cache lock poisoned");
        inner
            .values()
            .filter(|w| w.id.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn refs(&self) -> HashSet<WorkloadRef> {
        let inner = self.inner.read().expect("workload cache lock poisoned");
        inner.keys().cloned().collect()
    }

    pub fn namespaces(&self) -> HashSet<String> {
        let inner = self.inner.read().expect("workload cache lock poisoned");
        inner.values().map(|w| w.id.namespace.clone()).collect()
    }

    pub fn find_pod(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.get(&WorkloadRef {
            kind: WorkloadKind::Pod,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Drops every cached workload of `kind` that is not in `keep`,
    /// returning the dropped identities. Used after a watch re-list.
    fn retain_kind(&self, kind: WorkloadKind, keep: &HashSet<WorkloadRef>) -> Vec<WorkloadRef> {
        let mut inner = self.inner.write().expect("workload cache lock poisoned");
        let stale: Vec<WorkloadRef> = inner
            .keys()
            .filter(|id| id.kind == kind && !keep.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            inner.remove(id);
        }
        stale
    }
}

enum Msg {
    Started(WorkloadKind),
    Page(WorkloadKind, Workload),
    Applied(Workload),
    Deleted(WorkloadRef),
    Synced(WorkloadKind),
}

/// Runs the merged workload watchers until shutdown, keeping `cache` current
/// and forwarding change events to the correlator.
pub async fn run_workload_informers(
    client: Client,
    watch_namespace: WatchNamespace,
    cache: WorkloadCache,
    tx: mpsc::Sender<WorkloadEvent>,
    shutdown: Shutdown,
) {
    let config = watcher::Config::default();

    let mut streams = stream::select_all(vec![
        watcher(watch_namespace.api::<Deployment>(&client), config.clone())
            .default_backoff()
            .map(|r| r.map(|event| convert(WorkloadKind::Deployment, event, project_deployment)))
            .boxed(),
        watcher(watch_namespace.api::<StatefulSet>(&client), config.clone())
            .default_backoff()
            .map(|r| r.map(|event| convert(WorkloadKind::StatefulSet, event, project_stateful_set)))
            .boxed(),
        watcher(watch_namespace.api::<DaemonSet>(&client), config.clone())
            .default_backoff()
            .map(|r| r.map(|event| convert(WorkloadKind::DaemonSet, event, project_daemon_set)))
            .boxed(),
        watcher(watch_namespace.api::<Job>(&client), config.clone())
            .default_backoff()
            .map(|r| r.map(|event| convert(WorkloadKind::Job, event, project_job)))
            .boxed(),
        watcher(watch_namespace.api::<Pod>(&client), config)
            .default_backoff()
            .map(|r| r.map(|event| convert(WorkloadKind::Pod, event, project_pod)))
            .boxed(),
    ]);

    let mut resyncing: HashMap<WorkloadKind, HashSet<WorkloadRef>> = HashMap::new();
    let mut stop = std::pin::pin!(shutdown.wait());

    loop {
        let item = tokio::select! {
            () = &mut stop => {
                info!("workload informers shutting down");
                return;
            }
            item = streams.next() => item,
        };

        let msg = match item {
            Some(Ok(Some(msg))) => msg,
            Some(Ok(None)) => continue,
            Some(Err(error)) => {
                warn!(%error, "workload watch failed, backing off");
                continue;
            }
            None => {
                warn!("all workload watch streams ended");
                return;
            }
        };

        let event = match msg {
            Msg::Started(kind) => {
                resyncing.insert(kind, HashSet::new());
                continue;
            }
            Msg::Page(kind, workload) => {
                if let Some(seen) = resyncing.get_mut(&kind) {
                    seen.insert(workload.id.clone());
                }
                cache.upsert(workload.clone());
                WorkloadEvent::Upserted(workload)
            }
            Msg::Applied(workload) => {
                cache.upsert(workload.clone());
                WorkloadEvent::Upserted(workload)
            }
            Msg::Deleted(id) => {
                if !cache.remove(&id) {
                    continue;
                }
                WorkloadEvent::Removed(id)
            }
            Msg::Synced(kind) => {
                if let Some(seen) = resyncing.remove(&kind) {
                    for stale in cache.retain_kind(kind, &seen) {
                        debug!(workload = %stale, "pruned workload gone during resync");
                        if tx.send(WorkloadEvent::Removed(stale)).await.is_err() {
                            return;
                        }
                    }
                }
                WorkloadEvent::Resynced
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

fn convert<K>(
    kind: WorkloadKind,
    event: watcher::Event<K>,
    project: fn(&K) -> Option<Workload>,
) -> Option<Msg>
where
    K: kube::Resource,
{
    match event {
        watcher::Event::Init => Some(Msg::Started(kind)),
        watcher::Event::InitApply(object) => project(&object).map(|w| Msg::Page(kind, w)),
        watcher::Event::InitDone => Some(Msg::Synced(kind)),
        watcher::Event::Apply(object) => project(&object).map(Msg::Applied),
        watcher::Event::Delete(object) => {
            let namespace = object.meta().namespace.clone()?;
            let name = object.meta().name.clone()?;
            Some(Msg::Deleted(WorkloadRef {
                kind,
                namespace,
                name,
            }))
        }
    }
}

/// Selector matching runs against pod labels, so controllers contribute
/// their pod template labels merged over their own.
fn merged_meta<K: kube::Resource>(
    object: &K,
    template: Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = object.labels().clone();
    let mut annotations = object.annotations().clone();
    if let Some(meta) = template.and_then(|t| t.metadata.as_ref()) {
        if let Some(template_labels) = &meta.labels {
            labels.extend(template_labels.clone());
        }
        if let Some(template_annotations) = &meta.annotations {
            annotations.extend(template_annotations.clone());
        }
    }
    (labels, annotations)
}

fn workload_of<K: kube::Resource>(
    object: &K,
    kind: WorkloadKind,
    template: Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
) -> Option<Workload> {
    let namespace = object.meta().namespace.clone()?;
    let name = object.meta().name.clone()?;
    let (labels, annotations) = merged_meta(object, template);
    Some(Workload {
        id: WorkloadRef {
            kind,
            namespace,
            name,
        },
        labels,
        annotations,
        owner: None,
    })
}

fn project_deployment(deployment: &Deployment) -> Option<Workload> {
    let template = deployment.spec.as_ref().map(|s| &s.template);
    workload_of(deployment, WorkloadKind::Deployment, template)
}

fn project_stateful_set(stateful_set: &StatefulSet) -> Option<Workload> {
    let template = stateful_set.spec.as_ref().map(|s| &s.template);
    workload_of(stateful_set, WorkloadKind::StatefulSet, template)
}

fn project_daemon_set(daemon_set: &DaemonSet) -> Option<Workload> {
    let template = daemon_set.spec.as_ref().map(|s| &s.template);
    workload_of(daemon_set, WorkloadKind::DaemonSet, template)
}

fn project_job(job: &Job) -> Option<Workload> {
    let template = job.spec.as_ref().map(|s| &s.template);
    workload_of(job, WorkloadKind::Job, template)
}

fn project_pod(pod: &Pod) -> Option<Workload> {
    let namespace = pod.namespace()?;
    let name = pod.meta().name.clone()?;
    Some(Workload {
        id: WorkloadRef {
            kind: WorkloadKind::Pod,
            namespace,
            name,
        },
        labels: pod.labels().clone(),
        annotations: pod.annotations().clone(),
        owner: pod_owner(pod),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn deployment() -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "demo",
                "labels": {"team": "payments"}
            },
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {
                        "labels": {"app": "web"},
                        "annotations": {"prometheus.io/scrape": "true"}
                    },
                    "spec": {"containers": []}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn deployments_merge_template_labels_over_their_own() {
        let workload = project_deployment(&deployment()).unwrap();
        assert_eq!(workload.id.kind, WorkloadKind::Deployment);
        assert_eq!(workload.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(
            workload.labels.get("team").map(String::as_str),
            Some("payments")
        );
        assert_eq!(
            workload.annotations.get("prometheus.io/scrape").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn cache_retain_kind_prunes_only_that_kind() {
        let cache = WorkloadCache::default();
        let deployment = project_deployment(&deployment()).unwrap();
        cache.upsert(deployment.clone());
        let pod = Workload {
            id: WorkloadRef {
                kind: WorkloadKind::Pod,
                namespace: "demo".to_string(),
                name: "web-abc".to_string(),
            },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
        };
        cache.upsert(pod.clone());

        let stale = cache.retain_kind(WorkloadKind::Deployment, &HashSet::new());
        assert_eq!(stale, vec![deployment.id.clone()]);
        assert!(cache.get(&deployment.id).is_none());
        assert!(cache.get(&pod.id).is_some());
    }

    #[test]
    fn cache_lookups_by_namespace_and_pod() {
        let cache = WorkloadCache::default();
        cache.upsert(project_deployment(&deployment()).unwrap());

        assert_eq!(cache.in_namespace("demo").len(), 1);
        assert!(cache.in_namespace("other").is_empty());
        assert!(cache.find_pod("demo", "web").is_none());
    }
}
