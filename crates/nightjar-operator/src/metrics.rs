//! Process metrics, exposed on the metrics endpoint in Prometheus text
//! format.

use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Kubernetes Events written by the dispatcher.
    pub events_emitted: Counter,
    /// Notifications suppressed by the dispatcher's dedup window.
    pub notifications_deduplicated: Counter,
    /// Notifications suppressed by the per-namespace rate limit.
    pub notifications_rate_limited: Counter,
    /// Watch events dropped because the adapter could not parse the object.
    pub parse_errors: Counter,
    /// Constraints rejected for carrying out-of-enum classification values.
    pub constraints_rejected: Counter,
    /// Index events lost by slow subscribers.
    pub subscriber_lost_events: Counter,
    pub flow_drops_attributed: Counter,
    pub flow_drops_unattributed: Counter,
    /// Optimistic-concurrency conflicts while writing ConstraintReports.
    pub report_conflicts: Counter,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "nightjar_events_emitted",
            "Kubernetes Events written",
            metrics.events_emitted.clone(),
        );
        registry.register(
            "nightjar_notifications_deduplicated",
            "Notifications suppressed by the dedup window",
            metrics.notifications_deduplicated.clone(),
        );
        registry.register(
            "nightjar_notifications_rate_limited",
            "Notifications suppressed by the per-namespace rate limit",
            metrics.notifications_rate_limited.clone(),
        );
        registry.register(
            "nightjar_parse_errors",
            "Watch events dropped due to parse failures",
            metrics.parse_errors.clone(),
        );
        registry.register(
            "nightjar_constraints_rejected",
            "Constraints rejected for invalid classification",
            metrics.constraints_rejected.clone(),
        );
        registry.register(
            "nightjar_subscriber_lost_events",
            "Index events lost by slow subscribers",
            metrics.subscriber_lost_events.clone(),
        );
        registry.register(
            "nightjar_flow_drops_attributed",
            "Flow drops attributed to a constraint",
            metrics.flow_drops_attributed.clone(),
        );
        registry.register(
            "nightjar_flow_drops_unattributed",
            "Flow drops with no plausibly relevant constraint",
            metrics.flow_drops_unattributed.clone(),
        );
        registry.register(
            "nightjar_report_conflicts",
            "ConstraintReport status write conflicts",
            metrics.report_conflicts.clone(),
        );
        metrics
    }
}
