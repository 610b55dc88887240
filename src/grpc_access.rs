//! GRPC access logging.
//!
//! Every piece of per-request and per-message logging lives here so it can be
//! turned up or down together. Setting `xds_sequencer::grpc_access=LEVEL`
//! adjusts all of it without having to remember tower_http's log targets.

use std::time::Duration;

use tower_http::classify::GrpcFailureClass;
use tracing::{info_span, Span};
use xds_api::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use crate::api::ClientId;
use crate::xds::Protocol;

macro_rules! layer {
    () => {
        tower_http::trace::TraceLayer::new_for_grpc()
            .make_span_with(crate::grpc_access::make_span)
            .on_request(crate::grpc_access::on_request)
            .on_response(crate::grpc_access::on_response)
            .on_eos(crate::grpc_access::on_eos)
            .on_failure(crate::grpc_access::on_failure)
    };
}
pub(crate) use layer;

/// Open a span for an RPC. ADS streams are tagged with their xDS protocol so
/// every event on a stream can be tied back to it.
pub(crate) fn make_span(request: &http::Request<tonic::transport::Body>) -> Span {
    let path = request.uri().path();
    info_span!("rpc", protocol = stream_protocol(path), path)
}

fn stream_protocol(path: &str) -> &'static str {
    match path.rsplit('/').next() {
        Some("StreamAggregatedResources") => Protocol::Sotw.as_str(),
        Some("DeltaAggregatedResources") => Protocol::Delta.as_str(),
        _ => "none",
    }
}

pub(crate) fn on_request(_: &http::Request<tonic::transport::Body>, _: &Span) {
    tracing::debug!("stream opened")
}

pub(crate) fn on_response<B>(_: &http::Response<B>, latency: Duration, _: &Span) {
    tracing::debug!(latency_us = %latency.as_micros(), "headers sent")
}

pub(crate) fn on_eos(trailers: Option<&http::HeaderMap>, duration: Duration, _: &Span) {
    let code = trailers
        .and_then(tonic::Status::from_header_map)
        .map(|status| status.code());

    tracing::debug!(?code, duration_ms = %duration.as_millis(), "stream closed")
}

pub(crate) fn on_failure(failure: GrpcFailureClass, duration: Duration, _: &Span) {
    tracing::warn!(%failure, duration_ms = %duration.as_millis(), "stream failed")
}

/// Log a single xDS message sent or received on an ADS stream.
pub(crate) trait AccessLog {
    fn log(&self, client: ClientId);
}

impl AccessLog for DiscoveryRequest {
    fn log(&self, client: ClientId) {
        tracing::debug!(
            %client,
            v = self.version_info,
            n = self.response_nonce,
            ty = self.type_url,
            r = ?self.resource_names,
            error_code = self.error_detail.as_ref().map(|e| e.code),
            error_message = self.error_detail.as_ref().map(|e| &e.message),
            "DiscoveryRequest",
        );
    }
}

impl AccessLog for DiscoveryResponse {
    fn log(&self, client: ClientId) {
        tracing::debug!(
            %client,
            v = self.version_info,
            n = self.nonce,
            ty = self.type_url,
            r_count = self.resources.len(),
            "DiscoveryResponse",
        );
    }
}

impl AccessLog for DeltaDiscoveryRequest {
    fn log(&self, client: ClientId) {
        tracing::debug!(
            %client,
            n = self.response_nonce,
            ty = self.type_url,
            sub = ?self.resource_names_subscribe,
            unsub = ?self.resource_names_unsubscribe,
            init = ?self.initial_resource_versions,
            error_code = self.error_detail.as_ref().map(|e| e.code),
            error_message = self.error_detail.as_ref().map(|e| &e.message),
            "DeltaDiscoveryRequest",
        );
    }
}

impl AccessLog for DeltaDiscoveryResponse {
    fn log(&self, client: ClientId) {
        tracing::debug!(
            %client,
            v = self.system_version_info,
            n = self.nonce,
            ty = self.type_url,
            added = self.resources.len(),
            removed = self.removed_resources.len(),
            "DeltaDiscoveryResponse",
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_protocol() {
        assert_eq!(
            stream_protocol(
                "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources"
            ),
            "sotw"
        );
        assert_eq!(
            stream_protocol(
                "/envoy.service.discovery.v3.AggregatedDiscoveryService/DeltaAggregatedResources"
            ),
            "delta"
        );
        assert_eq!(
            stream_protocol("/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo"),
            "none"
        );
    }
}
