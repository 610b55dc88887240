use xds_api::pb::envoy::config::core::v3::Node;
use xds_api::pb::envoy::service::discovery::v3::{DeltaDiscoveryRequest, DiscoveryRequest};
use xds_api::pb::google::rpc::Status;

/// The fields shared by SOTW and Delta discovery requests.
pub trait XdsRequest {
    fn type_url(&self) -> &str;

    fn node(&self) -> Option<&Node>;

    fn response_nonce(&self) -> &str;

    fn error_detail(&self) -> Option<&Status>;
}

macro_rules! impl_xds_request {
    ($($request:ty),* $(,)?) => {
        $(
            impl XdsRequest for $request {
                fn type_url(&self) -> &str {
                    &self.type_url
                }

                fn node(&self) -> Option<&Node> {
                    self.node.as_ref()
                }

                fn response_nonce(&self) -> &str {
                    &self.response_nonce
                }

                fn error_detail(&self) -> Option<&Status> {
                    self.error_detail.as_ref()
                }
            }
        )*
    };
}

impl_xds_request!(DiscoveryRequest, DeltaDiscoveryRequest);
