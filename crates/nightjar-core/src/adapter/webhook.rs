//! Adapter for admission webhook configurations.
//!
//! Webhook configurations are cluster-scoped, so the constraints they produce
//! show up in every namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;

use crate::{
    adapter::{Adapter, HandledKind, ParseError, observed_now, source_ref, typed},
    constraint::{Constraint, ConstraintType, Effect, Scope, Severity, SourceRef},
};

const GROUP: &str = "admissionregistration.k8s.io";

pub struct AdmissionWebhookAdapter;

impl Adapter for AdmissionWebhookAdapter {
    fn name(&self) -> &'static str {
        "admission-webhook"
    }

    fn handled_kinds(&self) -> Vec<HandledKind> {
        vec![
            HandledKind::new(GROUP, "ValidatingWebhookConfiguration"),
            HandledKind::new(GROUP, "MutatingWebhookConfiguration"),
        ]
    }

    fn parse(
        &self,
        object: &DynamicObject,
        kind: &HandledKind,
    ) -> Result<Vec<Constraint>, ParseError> {
        let source = source_ref(object, kind)?;

        let (webhooks, mutating) = if kind.kind == "MutatingWebhookConfiguration" {
            let config: MutatingWebhookConfiguration = typed(object, "MutatingWebhookConfiguration")?;
            let webhooks = config
                .webhooks
                .unwrap_or_default()
                .into_iter()
                .map(|w| WebhookSummary {
                    name: w.name,
                    failure_policy: w.failure_policy,
                    object_selector: w.object_selector,
                })
                .collect::<Vec<_>>();
            (webhooks, true)
        } else {
            let config: ValidatingWebhookConfiguration =
                typed(object, "ValidatingWebhookConfiguration")?;
            let webhooks = config
                .webhooks
                .unwrap_or_default()
                .into_iter()
                .map(|w| WebhookSummary {
                    name: w.name,
                    failure_policy: w.failure_policy,
                    object_selector: w.object_selector,
                })
                .collect::<Vec<_>>();
            (webhooks, false)
        };

        // A configuration without webhook entries is recognized but carries
        // no policy signal.
        if webhooks.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![webhook_constraint(
            source,
            &webhooks,
            mutating,
            object.metadata.resource_version.clone(),
        )])
    }
}

struct WebhookSummary {
    name: String,
    failure_policy: Option<String>,
    object_selector: Option<LabelSelector>,
}

fn webhook_constraint(
    source: SourceRef,
    webhooks: &[WebhookSummary],
    mutating: bool,
    resource_version: Option<String>,
) -> Constraint {
    let fail_closed = webhooks
        .iter()
        .any(|w| w.failure_policy.as_deref() == Some("Fail"));

    let mut details = BTreeMap::new();
    details.insert("mutating".to_string(), mutating.to_string());
    details.insert(
        "webhooks".to_string(),
        webhooks
            .iter()
            .map(|w| w.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    for webhook in webhooks {
        if let Some(policy) = &webhook.failure_policy {
            details.insert(format!("failurePolicy.{}", webhook.name), policy.clone());
        }
    }

    let verb = if mutating { "mutates" } else { "validates" };
    let summary = if fail_closed {
        format!(
            "admission webhook {verb} requests and rejects them when the webhook is unreachable"
        )
    } else {
        format!("admission webhook {verb} requests")
    };

    let mut constraint = Constraint {
        name: source.name.clone(),
        namespace: None,
        source,
        constraint_type: ConstraintType::Admission,
        severity: if fail_closed {
            Severity::Warning
        } else {
            Severity::Info
        },
        effect: if fail_closed { Effect::Deny } else { Effect::Audit },
        workload_selector: webhooks.first().and_then(|w| w.object_selector.clone()),
        scope: Scope::Cluster,
        summary,
        details,
        tags: Vec::new(),
        last_observed: observed_now(),
        adapter: "admission-webhook".to_string(),
        resource_version,
    };
    constraint.push_tag("admission");
    if mutating {
        constraint.push_tag("mutating");
    }
    constraint
}
