//! Which namespaces the controller watches.

use std::convert::Infallible;

use kube::{Api, Client, core::DynamicObject, discovery::ApiResource};
use serde::de::DeserializeOwned;

/// Watch all namespaces, or restrict the controller to a single one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl std::str::FromStr for WatchNamespace {
    type Err = Infallible;

    fn from_str(namespace: &str) -> Result<Self, Self::Err> {
        Ok(if namespace.is_empty() {
            Self::All
        } else {
            Self::One(namespace.to_string())
        })
    }
}

impl WatchNamespace {
    pub fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + DeserializeOwned,
        K::DynamicType: Default,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }

    /// An API handle for a discovered resource. Cluster-scoped resources
    /// ignore the namespace restriction.
    pub fn dynamic_api(
        &self,
        client: &Client,
        resource: &ApiResource,
        namespaced: bool,
    ) -> Api<DynamicObject> {
        match (self, namespaced) {
            (Self::One(namespace), true) => {
                Api::namespaced_with(client.clone(), namespace, resource)
            }
            _ => Api::all_with(client.clone(), resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_means_all_namespaces() {
        assert_eq!("".parse::<WatchNamespace>().unwrap(), WatchNamespace::All);
        assert_eq!(
            "demo".parse::<WatchNamespace>().unwrap(),
            WatchNamespace::One("demo".to_string())
        );
    }
}
