//! Adapters turn raw cluster objects into normalized constraints.
//!
//! Each adapter declares a stable name and the set of resource kinds it
//! claims. The [`AdapterRegistry`] routes observed objects to exactly one
//! adapter; the generic fallback adapter is consulted only when no specific
//! adapter claims a kind.

use std::{fmt::Display, sync::Arc, sync::RwLock};

use indexmap::IndexMap;
use jiff::Timestamp;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::constraint::{Constraint, SourceRef};

pub mod cilium;
pub mod gatekeeper;
pub mod generic;
pub mod kyverno;
pub mod network_policy;
pub mod resource_quota;
pub mod webhook;

pub use cilium::CiliumNetworkPolicyAdapter;
pub use gatekeeper::GatekeeperAdapter;
pub use generic::GenericAdapter;
pub use kyverno::KyvernoAdapter;
pub use network_policy::NetworkPolicyAdapter;
pub use resource_quota::{LimitRangeAdapter, ResourceQuotaAdapter};
pub use webhook::AdmissionWebhookAdapter;

type Result<T, E = ParseError> = std::result::Result<T, E>;

/// A resource kind an adapter claims, identified by API group and kind.
///
/// The kind `*` claims every kind within a group, which is how the Gatekeeper
/// adapter covers the open-ended set of constraint-template instances.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HandledKind {
    pub group: String,
    pub kind: String,
}

impl HandledKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn any_in_group(group: impl Into<String>) -> Self {
        Self::new(group, "*")
    }

    pub fn is_group_wildcard(&self) -> bool {
        self.kind == "*"
    }
}

impl Display for HandledKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.group, self.kind)
        }
    }
}

/// The error type returned by [`Adapter::parse`].
///
/// A parse error always refers to a single observed object; the watch that
/// delivered it keeps running.
#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("object has no metadata.{field}"))]
    MissingMetadata { field: &'static str },

    #[snafu(display("required field {field:?} is missing or malformed"))]
    MissingField { field: &'static str },

    #[snafu(display("failed to deserialize object as {kind}"))]
    Deserialize {
        source: serde_json::Error,
        kind: &'static str,
    },

    #[snafu(display("annotation {annotation:?} carries unsupported value {value:?}"))]
    InvalidClassification { annotation: String, value: String },
}

/// Converts one observed cluster object into zero or more [`Constraint`]s.
///
/// Parsing is pure: implementations must not mutate their input and must not
/// touch the cluster. Returning an empty vector is legal and means the object
/// is recognized but carries no policy signal.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// The resource kinds this adapter claims. The generic fallback adapter
    /// returns an empty set and is wired into the registry separately.
    fn handled_kinds(&self) -> Vec<HandledKind>;

    fn parse(&self, object: &DynamicObject, kind: &HandledKind) -> Result<Vec<Constraint>>;
}

#[derive(Debug, PartialEq, Snafu)]
pub enum RegistryError {
    #[snafu(display(
        "resource kind {kind} is already handled by adapter {existing:?}, refusing ambiguous \
         registration of {candidate:?}"
    ))]
    DuplicateHandledKind {
        kind: HandledKind,
        existing: String,
        candidate: String,
    },
}

#[derive(Default)]
struct RegistryInner {
    by_name: IndexMap<&'static str, Arc<dyn Adapter>>,
    by_kind: IndexMap<HandledKind, Arc<dyn Adapter>>,
    generic: Option<Arc<dyn Adapter>>,
}

/// Holds the set of registered adapters and maps each handled resource kind
/// to exactly one of them.
///
/// Safe for concurrent readers with exclusive writers.
#[derive(Default)]
pub struct AdapterRegistry {
    inner: RwLock<RegistryInner>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter.
    ///
    /// Registration is idempotent on the adapter name. A second adapter
    /// claiming an already-handled resource kind is rejected so that no kind
    /// can ever be parsed ambiguously.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("adapter registry lock poisoned");

        let name = adapter.name();
        if inner.by_name.contains_key(name) {
            return Ok(());
        }

        for kind in adapter.handled_kinds() {
            if let Some(existing) = inner.by_kind.get(&kind) {
                return DuplicateHandledKindSnafu {
                    kind,
                    existing: existing.name().to_string(),
                    candidate: name.to_string(),
                }
                .fail();
            }
        }

        for kind in adapter.handled_kinds() {
            inner.by_kind.insert(kind, Arc::clone(&adapter));
        }
        inner.by_name.insert(name, adapter);
        Ok(())
    }

    /// Installs the fallback adapter consulted when no specific adapter
    /// claims a kind.
    pub fn register_generic(&self, adapter: Arc<dyn Adapter>) {
        let mut inner = self.inner.write().expect("adapter registry lock poisoned");
        inner.generic = Some(adapter);
    }

    /// Resolves the adapter responsible for a resource kind.
    ///
    /// Exact claims win over group wildcards, which win over the generic
    /// fallback.
    pub fn lookup_by_kind(&self, kind: &HandledKind) -> Option<Arc<dyn Adapter>> {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        if let Some(adapter) = inner.by_kind.get(kind) {
            return Some(Arc::clone(adapter));
        }
        let wildcard = HandledKind::any_in_group(kind.group.clone());
        if let Some(adapter) = inner.by_kind.get(&wildcard) {
            return Some(Arc::clone(adapter));
        }
        inner.generic.as_ref().map(Arc::clone)
    }

    /// Like [`AdapterRegistry::lookup_by_kind`] but without the generic
    /// fallback. The discovery engine uses this to tell specifically claimed
    /// kinds apart from custom resources that merely qualify for fallback
    /// parsing.
    pub fn lookup_specific(&self, kind: &HandledKind) -> Option<Arc<dyn Adapter>> {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        if let Some(adapter) = inner.by_kind.get(kind) {
            return Some(Arc::clone(adapter));
        }
        let wildcard = HandledKind::any_in_group(kind.group.clone());
        inner.by_kind.get(&wildcard).map(Arc::clone)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        inner.by_name.get(name).map(Arc::clone)
    }

    /// All registered adapters, in registration order. The generic fallback
    /// is listed last when installed.
    pub fn enumerate(&self) -> Vec<Arc<dyn Adapter>> {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        inner
            .by_name
            .values()
            .cloned()
            .chain(inner.generic.iter().cloned())
            .collect()
    }

    /// Every specifically claimed resource kind, in registration order.
    pub fn all_handled_kinds(&self) -> Vec<HandledKind> {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        inner.by_kind.keys().cloned().collect()
    }

    pub fn has_generic(&self) -> bool {
        let inner = self.inner.read().expect("adapter registry lock poisoned");
        inner.generic.is_some()
    }
}

/// Builds a registry with every built-in adapter installed.
pub fn builtin_registry() -> Result<AdapterRegistry, RegistryError> {
    let registry = AdapterRegistry::new();
    registry.register(Arc::new(NetworkPolicyAdapter))?;
    registry.register(Arc::new(CiliumNetworkPolicyAdapter))?;
    registry.register(Arc::new(ResourceQuotaAdapter))?;
    registry.register(Arc::new(LimitRangeAdapter))?;
    registry.register(Arc::new(AdmissionWebhookAdapter))?;
    registry.register(Arc::new(GatekeeperAdapter))?;
    registry.register(Arc::new(KyvernoAdapter))?;
    registry.register_generic(Arc::new(GenericAdapter));
    Ok(registry)
}

/// Identity of the source object, taken from the object's type and object
/// metadata.
pub(crate) fn source_ref(object: &DynamicObject, kind: &HandledKind) -> Result<SourceRef> {
    let name = object
        .metadata
        .name
        .clone()
        .context(MissingMetadataSnafu { field: "name" })?;

    let api_version = object
        .types
        .as_ref()
        .map(|t| t.api_version.clone())
        .unwrap_or_else(|| {
            if kind.group.is_empty() {
                "v1".to_string()
            } else {
                format!("{}/v1", kind.group)
            }
        });
    let kind_name = object
        .types
        .as_ref()
        .map_or_else(|| kind.kind.clone(), |t| t.kind.clone());

    Ok(SourceRef {
        api_version,
        kind: kind_name,
        namespace: object.metadata.namespace.clone(),
        name,
    })
}

/// Re-interprets a dynamic object as a typed Kubernetes resource.
pub(crate) fn typed<K>(object: &DynamicObject, kind: &'static str) -> Result<K>
where
    K: DeserializeOwned,
{
    let value = serde_json::to_value(object).context(DeserializeSnafu { kind })?;
    serde_json::from_value(value).context(DeserializeSnafu { kind })
}

pub(crate) fn observed_now() -> Timestamp {
    Timestamp::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdapter {
        name: &'static str,
        kinds: Vec<HandledKind>,
    }

    impl Adapter for FakeAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handled_kinds(&self) -> Vec<HandledKind> {
            self.kinds.clone()
        }

        fn parse(&self, _object: &DynamicObject, _kind: &HandledKind) -> Result<Vec<Constraint>> {
            Ok(Vec::new())
        }
    }

    fn network_policy_kind() -> HandledKind {
        HandledKind::new("networking.k8s.io", "NetworkPolicy")
    }

    #[test]
    fn registration_is_idempotent_on_name() {
        let registry = AdapterRegistry::new();
        let adapter = Arc::new(FakeAdapter {
            name: "network-policy",
            kinds: vec![network_policy_kind()],
        });
        registry.register(adapter.clone()).unwrap();
        registry.register(adapter).unwrap();
        assert_eq!(registry.enumerate().len(), 1);
    }

    #[test]
    fn second_claim_of_a_handled_kind_is_rejected() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(FakeAdapter {
                name: "network-policy",
                kinds: vec![network_policy_kind()],
            }))
            .unwrap();

        let err = registry
            .register(Arc::new(FakeAdapter {
                name: "other",
                kinds: vec![network_policy_kind()],
            }))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandledKind { .. }));
        assert!(registry.lookup_by_name("other").is_none());
    }

    #[test]
    fn specific_adapter_wins_over_generic() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(FakeAdapter {
                name: "network-policy",
                kinds: vec![network_policy_kind()],
            }))
            .unwrap();
        registry.register_generic(Arc::new(FakeAdapter {
            name: "generic",
            kinds: Vec::new(),
        }));

        let resolved = registry.lookup_by_kind(&network_policy_kind()).unwrap();
        assert_eq!(resolved.name(), "network-policy");

        let fallback = registry
            .lookup_by_kind(&HandledKind::new("example.com", "Widget"))
            .unwrap();
        assert_eq!(fallback.name(), "generic");
    }

    #[test]
    fn group_wildcard_claims_every_kind_in_the_group() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(FakeAdapter {
                name: "gatekeeper",
                kinds: vec![HandledKind::any_in_group("constraints.gatekeeper.sh")],
            }))
            .unwrap();

        let resolved = registry
            .lookup_by_kind(&HandledKind::new(
                "constraints.gatekeeper.sh",
                "K8sRequiredLabels",
            ))
            .unwrap();
        assert_eq!(resolved.name(), "gatekeeper");
    }

    #[test]
    fn builtin_registry_registers_without_conflicts() {
        let registry = builtin_registry().unwrap();
        assert!(registry.has_generic());
        assert!(registry.lookup_by_name("network-policy").is_some());
        assert!(
            registry
                .lookup_by_kind(&HandledKind::new("", "ResourceQuota"))
                .is_some()
        );
    }
}
