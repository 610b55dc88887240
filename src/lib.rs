//! An xDS control plane engine for Envoy.
//!
//! Serves SOTW and Delta ADS streams, turning a stream of network updates into
//! a sequence of xDS responses that never leaves a client referring to a
//! resource it hasn't received yet. Additions go out in dependency order and
//! are acknowledged before removals are sent.
//!
//! Embedders describe their network with a [NetworkSource](api::NetworkSource)
//! and build xDS resources from it with [ResourceBuilder](api::ResourceBuilder)s,
//! then hand both to an [AdsServer](xds::AdsServer).

pub mod api;
pub mod backlog;
pub mod config;
mod grpc_access;
pub mod metrics;
pub mod relay;
pub mod xds;
