//! Reconciles one ConstraintReport per namespace.
//!
//! Index changes mark a namespace dirty with a debounce; a periodic full
//! sweep re-reconciles everything so that lost subscriber events are
//! recovered transparently. Status writes use optimistic concurrency with a
//! bounded retry.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::{
    Api, Client,
    api::PostParams,
};
use nightjar_core::{
    constraint::{Constraint, Scope},
    index::{ChangeEvent, ConstraintIndex},
    requirements::{EvalMode, Evaluator},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    crd::{ConstraintReport, ConstraintReportSpec, REPORT_NAME, summarize},
    metrics::Metrics,
    shutdown::Shutdown,
    workloads::WorkloadCache,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(120);
const FLUSH_TICK: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const WRITE_ATTEMPTS: usize = 3;

type Result<T, E = ReportError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ReportError {
    #[snafu(display("failed to read report for namespace {namespace}"))]
    ReadReport {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to write report for namespace {namespace}"))]
    WriteReport {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to serialize report for namespace {namespace}"))]
    SerializeReport {
        source: serde_json::Error,
        namespace: String,
    },

    #[snafu(display("gave up writing report for namespace {namespace} after {attempts} conflicts"))]
    Contended { namespace: String, attempts: usize },
}

/// Namespaces awaiting reconciliation, each with its debounce deadline. An
/// already-pending namespace keeps its earlier deadline so a stream of
/// changes cannot postpone the flush forever.
struct DirtySet {
    debounce: Duration,
    deadlines: HashMap<String, Instant>,
}

impl DirtySet {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadlines: HashMap::new(),
        }
    }

    /// Marks the namespaces a change event touches: its own namespace for a
    /// namespace-scoped constraint, every known namespace for a
    /// cluster-scoped one (those show up in every report).
    fn mark(&mut self, event: &ChangeEvent, every_namespace: impl FnOnce() -> Vec<String>) {
        let constraint = event.constraint();
        match (&constraint.scope, &constraint.namespace) {
            (Scope::Namespace, Some(namespace)) => self.mark_one(namespace.clone()),
            _ => self.mark_all(every_namespace()),
        }
    }

    fn mark_one(&mut self, namespace: String) {
        let deadline = Instant::now() + self.debounce;
        self.deadlines.entry(namespace).or_insert(deadline);
    }

    fn mark_all(&mut self, namespaces: Vec<String>) {
        for namespace in namespaces {
            self.mark_one(namespace);
        }
    }

    /// Removes and returns every namespace whose deadline has passed.
    fn take_due(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(namespace, _)| namespace.clone())
            .collect();
        for namespace in &due {
            self.deadlines.remove(namespace);
        }
        due
    }

    /// Puts a namespace back after a failed reconcile, a full debounce out.
    fn requeue(&mut self, namespace: String, now: Instant) {
        self.deadlines.insert(namespace, now + self.debounce);
    }
}

pub struct ReportReconciler {
    client: Client,
    index: Arc<ConstraintIndex>,
    cache: WorkloadCache,
    evaluator: Arc<Evaluator>,
    leader: watch::Receiver<bool>,
    metrics: Metrics,

    dirty: DirtySet,
}

impl ReportReconciler {
    pub fn new(
        client: Client,
        index: Arc<ConstraintIndex>,
        cache: WorkloadCache,
        evaluator: Arc<Evaluator>,
        leader: watch::Receiver<bool>,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            index,
            cache,
            evaluator,
            leader,
            metrics,
            dirty: DirtySet::new(DEFAULT_DEBOUNCE),
        }
    }

    pub async fn run(mut self, mut rx: broadcast::Receiver<ChangeEvent>, shutdown: Shutdown) {
        let mut stop = std::pin::pin!(shutdown.wait());
        let mut tick = tokio::time::interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = &mut stop => {
                    info!("report reconciler shutting down");
                    return;
                }
                event = rx.recv() => match event {
                    Ok(event) => {
                        let known = self.known_namespaces();
                        self.dirty.mark(&event, || known);
                    }
                    Err(broadcast::error::RecvError::Lagged(lost)) => {
                        // The sweep covers everything, so loss is harmless.
                        self.metrics.subscriber_lost_events.inc_by(lost);
                        let known = self.known_namespaces();
                        self.dirty.mark_all(known);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = sweep.tick() => {
                    let known = self.known_namespaces();
                    self.dirty.mark_all(known);
                }
                _ = tick.tick() => self.flush_due().await,
            }
        }
    }

    /// Every namespace that currently holds constraints or workloads.
    fn known_namespaces(&self) -> Vec<String> {
        let mut namespaces = self.index.namespaces();
        namespaces.extend(self.cache.namespaces());
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    async fn flush_due(&mut self) {
        if !*self.leader.borrow() {
            return;
        }
        let now = Instant::now();
        for namespace in self.dirty.take_due(now) {
            if let Err(error) = self.reconcile_namespace(&namespace).await {
                warn!(namespace, %error, "report reconciliation failed");
                self.dirty.requeue(namespace, now);
            }
        }
    }

    /// Builds and writes the report for one namespace.
    async fn reconcile_namespace(&self, namespace: &str) -> Result<()> {
        let mut constraints = self.index.query_by_namespace(namespace);
        constraints.extend(self.requirement_constraints(namespace));

        let status = summarize(&constraints, Time(Utc::now()));
        let api: Api<ConstraintReport> = Api::namespaced(self.client.clone(), namespace);

        for attempt in 0..WRITE_ATTEMPTS {
            let mut report = match api
                .get_opt(REPORT_NAME)
                .await
                .context(ReadReportSnafu { namespace })?
            {
                Some(existing) => existing,
                None => {
                    let mut fresh = ConstraintReport::new(REPORT_NAME, ConstraintReportSpec::default());
                    fresh.metadata.namespace = Some(namespace.to_string());
                    api.create(&PostParams::default(), &fresh)
                        .await
                        .context(WriteReportSnafu { namespace })?
                }
            };

            report.status = Some(status.clone());
            let body =
                serde_json::to_vec(&report).context(SerializeReportSnafu { namespace })?;

            match api
                .replace_status(REPORT_NAME, &PostParams::default(), body)
                .await
            {
                Ok(_) => {
                    debug!(
                        namespace,
                        constraints = status.constraints.len(),
                        "report reconciled"
                    );
                    return Ok(());
                }
                Err(error) if should_retry(&error, attempt) => {
                    // Someone moved the resource version; re-read and retry.
                    self.metrics.report_conflicts.inc();
                    debug!(namespace, attempt, "report write conflict, retrying");
                }
                Err(error) if is_conflict(&error) => {
                    self.metrics.report_conflicts.inc();
                    return ContendedSnafu {
                        namespace,
                        attempts: WRITE_ATTEMPTS,
                    }
                    .fail();
                }
                Err(error) => {
                    return Err(error).context(WriteReportSnafu { namespace });
                }
            }
        }

        ContendedSnafu {
            namespace,
            attempts: WRITE_ATTEMPTS,
        }
        .fail()
    }

    /// Prerequisite constraints synthesized for the namespace's controllers.
    fn requirement_constraints(&self, namespace: &str) -> Vec<Constraint> {
        self.cache
            .in_namespace(namespace)
            .into_iter()
            // Pods roll up into their controller; evaluating both would
            // duplicate every finding.
            .filter(|workload| workload.owner.is_none())
            .flat_map(|workload| self.evaluator.evaluate(&workload, EvalMode::Batched))
            .collect()
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

/// A failed status write is retried only for version conflicts, and only
/// while the attempt budget lasts.
fn should_retry(error: &kube::Error, attempt: usize) -> bool {
    attempt + 1 < WRITE_ATTEMPTS && is_conflict(error)
}
