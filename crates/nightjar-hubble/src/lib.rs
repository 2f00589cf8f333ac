//! Streaming client for a Hubble flow relay.
//!
//! The observer maintains one persistent server-streaming RPC filtered to
//! drop verdicts and exposes a channel of enriched [`FlowDrop`] records.
//! Presence is optional; nothing else in Nightjar depends on it being
//! connected.

pub mod client;
pub mod observe;
pub mod proto;

pub use observe::{FlowDrop, FlowEndpoint, FlowObserver};
