//! Wire types for the Hubble relay `observer.Observer` service.
//!
//! Written the way `tonic-build` would emit them, trimmed to the fields the
//! flow observer actually reads.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetFlowsRequest {
    /// Number of flows to return before closing; ignored when `follow` is
    /// set.
    #[prost(uint64, tag = "1")]
    pub number: u64,

    #[prost(bool, tag = "3")]
    pub follow: bool,

    /// Server-side filters; a flow is delivered when any whitelist entry
    /// matches and no blacklist entry does.
    #[prost(message, repeated, tag = "4")]
    pub whitelist: ::prost::alloc::vec::Vec<FlowFilter>,

    #[prost(message, repeated, tag = "5")]
    pub blacklist: ::prost::alloc::vec::Vec<FlowFilter>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowFilter {
    #[prost(enumeration = "Verdict", repeated, tag = "1")]
    pub verdict: ::prost::alloc::vec::Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetFlowsResponse {
    #[prost(string, tag = "1")]
    pub node_name: ::prost::alloc::string::String,

    #[prost(message, optional, tag = "2")]
    pub flow: ::core::option::Option<Flow>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Flow {
    #[prost(enumeration = "Verdict", tag = "1")]
    pub verdict: i32,

    #[prost(string, tag = "2")]
    pub drop_reason_desc: ::prost::alloc::string::String,

    #[prost(message, optional, tag = "3")]
    pub source: ::core::option::Option<Endpoint>,

    #[prost(message, optional, tag = "4")]
    pub destination: ::core::option::Option<Endpoint>,

    #[prost(message, optional, tag = "5")]
    pub l4: ::core::option::Option<Layer4>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Endpoint {
    #[prost(string, tag = "1")]
    pub namespace: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub pod_name: ::prost::alloc::string::String,

    /// Labels in Cilium's `source:key=value` form.
    #[prost(string, repeated, tag = "3")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Layer4 {
    #[prost(message, optional, tag = "1")]
    pub tcp: ::core::option::Option<Tcp>,

    #[prost(message, optional, tag = "2")]
    pub udp: ::core::option::Option<Udp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tcp {
    #[prost(uint32, tag = "1")]
    pub source_port: u32,

    #[prost(uint32, tag = "2")]
    pub destination_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Udp {
    #[prost(uint32, tag = "1")]
    pub source_port: u32,

    #[prost(uint32, tag = "2")]
    pub destination_port: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Verdict {
    VerdictUnknown = 0,
    Forwarded = 1,
    Dropped = 2,
    Error = 3,
    Audit = 4,
}
