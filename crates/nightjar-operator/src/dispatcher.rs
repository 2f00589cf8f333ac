//! Turns correlator output into Kubernetes Events and side-channel sink
//! deliveries.
//!
//! Rate limiting is per namespace (token bucket), deduplication per
//! (workload, constraint) pair. Only the leader writes Events; sinks run
//! after the Event write and their failures are logged, never retried
//! inline.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Event as CoreEvent, EventSource, ObjectReference},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use nightjar_core::{
    notify::{DetailLevel, FlowDropNotification, Notification},
    workload::{WorkloadKind, WorkloadRef},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    consts::{
        ANNOTATION_CONSTRAINT_NAME, ANNOTATION_CONSTRAINT_TYPE, ANNOTATION_MANAGED_BY,
        ANNOTATION_SEVERITY, ANNOTATION_SOURCE_KIND, MANAGED_BY_VALUE,
    },
    metrics::Metrics,
    shutdown::Shutdown,
};

pub const DEFAULT_RATE_PER_MINUTE: u32 = 100;
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60 * 60);

/// The API server caps Event messages; stay well under its limit.
const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug)]
pub struct SinkError {
    pub name: &'static str,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink {} failed to deliver", self.name)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// A pluggable side output invoked after the Kubernetes Event is written.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// The default sink: one structured log line per notification.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        info!(
            workload = %notification.workload,
            constraint = %notification.constraint,
            severity = %notification.severity,
            "constraint affects workload"
        );
        Ok(())
    }
}

/// Token bucket: capacity of one minute's budget, refilled continuously.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(rate: u32) -> Self {
        let capacity = f64::from(rate);
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    pub fn try_take(&mut self) -> bool {
        self.take_at(Instant::now())
    }

    fn take_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Admit {
    Send,
    Deduplicated,
    RateLimited,
}

/// The combined per-pair dedup window and per-namespace token bucket that
/// gates every outgoing notification.
struct AdmissionGate {
    rate_per_minute: u32,
    dedup_window: Duration,
    buckets: HashMap<String, TokenBucket>,
    recently_sent: HashMap<String, Instant>,
}

impl AdmissionGate {
    fn new(rate_per_minute: u32, dedup_window: Duration) -> Self {
        Self {
            rate_per_minute,
            dedup_window,
            buckets: HashMap::new(),
            recently_sent: HashMap::new(),
        }
    }

    /// Decides whether a notification with this idempotency key may go out
    /// right now. A granted key is recorded, so replaying the same
    /// correlator output within the window yields at most one Event.
    fn admit(&mut self, key: &str, namespace: &str) -> Admit {
        let now = Instant::now();
        if self
            .recently_sent
            .get(key)
            .is_some_and(|at| now.duration_since(*at) < self.dedup_window)
        {
            return Admit::Deduplicated;
        }

        let rate = self.rate_per_minute;
        let bucket = self
            .buckets
            .entry(namespace.to_string())
            .or_insert_with(|| TokenBucket::per_minute(rate));
        if !bucket.try_take() {
            return Admit::RateLimited;
        }

        self.recently_sent.insert(key.to_string(), now);
        Admit::Send
    }

    /// Rate limiting without deduplication, for flow drop events which are
    /// expected to repeat.
    fn admit_unkeyed(&mut self, namespace: &str) -> Admit {
        let rate = self.rate_per_minute;
        let bucket = self
            .buckets
            .entry(namespace.to_string())
            .or_insert_with(|| TokenBucket::per_minute(rate));
        if bucket.try_take() {
            Admit::Send
        } else {
            Admit::RateLimited
        }
    }

    fn sweep(&mut self) {
        let window = self.dedup_window;
        self.recently_sent.retain(|_, at| at.elapsed() < window);
    }
}

pub struct Dispatcher {
    client: Client,
    detail_level: DetailLevel,
    leader: watch::Receiver<bool>,
    metrics: Metrics,
    sinks: Vec<Arc<dyn NotificationSink>>,
    gate: AdmissionGate,
}

impl Dispatcher {
    pub fn new(
        client: Client,
        detail_level: DetailLevel,
        leader: watch::Receiver<bool>,
        metrics: Metrics,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self {
            client,
            detail_level,
            leader,
            metrics,
            sinks,
            gate: AdmissionGate::new(DEFAULT_RATE_PER_MINUTE, DEFAULT_DEDUP_WINDOW),
        }
    }

    pub async fn run(
        mut self,
        mut notify_rx: mpsc::Receiver<Notification>,
        mut flow_rx: mpsc::Receiver<FlowDropNotification>,
        shutdown: Shutdown,
    ) {
        let mut stop = std::pin::pin!(shutdown.wait());
        let mut sweep = tokio::time::interval(Duration::from_secs(300));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = &mut stop => {
                    info!("dispatcher shutting down");
                    return;
                }
                Some(notification) = notify_rx.recv() => {
                    self.dispatch(notification).await;
                }
                Some(drop) = flow_rx.recv() => {
                    self.dispatch_flow_drop(drop).await;
                }
                _ = sweep.tick() => self.gate.sweep(),
            }
        }
    }

    async fn dispatch(&mut self, notification: Notification) {
        if !*self.leader.borrow() {
            return;
        }

        let namespace = notification.workload.namespace.clone();
        match self.gate.admit(&notification.idempotency_key(), &namespace) {
            Admit::Send => {}
            Admit::Deduplicated => {
                self.metrics.notifications_deduplicated.inc();
                return;
            }
            Admit::RateLimited => {
                self.metrics.notifications_rate_limited.inc();
                debug!(namespace, "notification rate limited");
                return;
            }
        }

        let event = notification_event(&notification);
        if let Err(error) = self.write_event(&namespace, &event).await {
            warn!(%error, workload = %notification.workload, "failed to write event");
            return;
        }
        self.metrics.events_emitted.inc();

        for sink in &self.sinks {
            if let Err(error) = sink.deliver(&notification).await {
                warn!(sink = sink.name(), %error, "sink delivery failed");
            }
        }
    }

    async fn dispatch_flow_drop(&mut self, drop: FlowDropNotification) {
        if !*self.leader.borrow() {
            return;
        }

        let namespace = drop.source_pod.namespace.clone();
        if self.gate.admit_unkeyed(&namespace) != Admit::Send {
            self.metrics.notifications_rate_limited.inc();
            return;
        }

        let event = flow_drop_event(&drop, self.detail_level);
        if let Err(error) = self.write_event(&namespace, &event).await {
            warn!(%error, pod = %drop.source_pod, "failed to write flow drop event");
            return;
        }
        self.metrics.events_emitted.inc();
    }

    async fn write_event(&self, namespace: &str, event: &CoreEvent) -> kube::Result<CoreEvent> {
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), event).await
    }
}

fn notification_event(notification: &Notification) -> CoreEvent {
    let message = clip_message(notification.message.clone(), MAX_MESSAGE_LEN);

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    annotations.insert(
        ANNOTATION_CONSTRAINT_TYPE.to_string(),
        notification.constraint_type.to_string(),
    );
    annotations.insert(
        ANNOTATION_CONSTRAINT_NAME.to_string(),
        notification.constraint.name.clone(),
    );
    annotations.insert(
        ANNOTATION_SEVERITY.to_string(),
        notification.severity.to_string(),
    );
    annotations.insert(
        ANNOTATION_SOURCE_KIND.to_string(),
        notification.source_kind.clone(),
    );

    event_on(
        &notification.workload,
        annotations,
        "ConstraintMatched",
        message,
        matches!(
            notification.severity,
            nightjar_core::constraint::Severity::Info
        ),
    )
}

fn flow_drop_event(drop: &FlowDropNotification, level: DetailLevel) -> CoreEvent {
    let message = clip_message(drop.message(level), MAX_MESSAGE_LEN);

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    annotations.insert(
        ANNOTATION_CONSTRAINT_TYPE.to_string(),
        drop.constraint.constraint_type.to_string(),
    );
    annotations.insert(
        ANNOTATION_CONSTRAINT_NAME.to_string(),
        drop.constraint.name.clone(),
    );
    annotations.insert(
        ANNOTATION_SOURCE_KIND.to_string(),
        drop.constraint.source.kind.clone(),
    );

    event_on(&drop.source_pod, annotations, "TrafficDropped", message, false)
}

fn event_on(
    workload: &WorkloadRef,
    annotations: BTreeMap<String, String>,
    reason: &str,
    message: String,
    informational: bool,
) -> CoreEvent {
    let now = Time(Utc::now());
    CoreEvent {
        metadata: ObjectMeta {
            generate_name: Some(format!("nightjar-{name}-", name = workload.name)),
            namespace: Some(workload.namespace.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        involved_object: object_reference(workload),
        reason: Some(reason.to_string()),
        message: Some(message),
        type_: Some(if informational { "Normal" } else { "Warning" }.to_string()),
        source: Some(EventSource {
            component: Some(MANAGED_BY_VALUE.to_string()),
            ..EventSource::default()
        }),
        reporting_component: Some(MANAGED_BY_VALUE.to_string()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        ..CoreEvent::default()
    }
}

fn object_reference(workload: &WorkloadRef) -> ObjectReference {
    let api_version = match workload.kind {
        WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => "apps/v1",
        WorkloadKind::Job => "batch/v1",
        WorkloadKind::Pod => "v1",
    };
    ObjectReference {
        api_version: Some(api_version.to_string()),
        kind: Some(workload.kind.to_string()),
        namespace: Some(workload.namespace.clone()),
        name: Some(workload.name.clone()),
        ..ObjectReference::default()
    }
}

/// Caps an Event message at `max_bytes`, marking the cut with `…`.
///
/// The API server rejects oversized Event messages outright, so clipping
/// must never split a UTF-8 character. Budgets too small to even hold the
/// mark are clipped bare.
fn clip_message(message: String, max_bytes: usize) -> String {
    const MARK: char = '…';

    if message.len() <= max_bytes {
        return message;
    }

    let budget = if max_bytes >= MARK.len_utf8() {
        max_bytes - MARK.len_utf8()
    } else {
        max_bytes
    };
    let cut = message
        .char_indices()
        .map(|(at, _)| at)
        .take_while(|at| *at <= budget)
        .last()
        .unwrap_or(0);

    let mut clipped = message;
    clipped.truncate(cut);
    if max_bytes >= MARK.len_utf8() {
        clipped.push(MARK);
    }
    clipped
}
