//! Core building blocks of the Nightjar control plane.
//!
//! This crate contains everything that is independent of the running cluster
//! connection: the normalized [`Constraint`](constraint::Constraint) record,
//! the [`Adapter`](adapter::Adapter) abstraction that produces constraints
//! from raw cluster objects, the [`ConstraintIndex`](index::ConstraintIndex)
//! holding them, and the [requirements](requirements) engine that synthesizes
//! "missing prerequisite" constraints.

pub mod adapter;
pub mod backoff;
pub mod constraint;
pub mod index;
pub mod notify;
pub mod requirements;
pub mod selector;
pub mod workload;

// External re-exports
pub use k8s_openapi;
pub use kube;
