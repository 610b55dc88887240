use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::server::NamedService;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, trace, warn};
use xds_api::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DiscoveryRequest,
};

use crate::api::ClientId;
use crate::grpc_access::{self, AccessLog};
use crate::xds::{ClientSession, Delta, ServerOptions, Sotw, XdsProtocol};

/// An ADS server. Every SOTW or Delta stream gets its own [ClientSession].
pub struct AdsServer<S, D> {
    options: Arc<ServerOptions<S, D>>,
}

impl<S, D> Clone for AdsServer<S, D> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
        }
    }
}

impl<S, D> AdsServer<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(options: ServerOptions<S, D>) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    fn stream<P>(
        &self,
        request: Request<Streaming<P::Request>>,
    ) -> Response<ResponseStream<P::Response>>
    where
        P: XdsProtocol,
        P::Request: AccessLog,
        P::Response: AccessLog,
    {
        let remote_addr = request.remote_addr();
        let requests = request.into_inner();

        let client = ClientId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ClientSession::<P, S, D>::new(
            client,
            remote_addr,
            self.options.clone(),
            Arc::new(tx.clone()),
        );
        tokio::spawn(run_stream(session, requests, tx));

        let responses: ResponseStream<P::Response> =
            Box::pin(UnboundedReceiverStream::new(rx).inspect(move |response| {
                if let Ok(response) = response {
                    response.log(client);
                }
            }));
        Response::new(responses)
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl<S, D> AggregatedDiscoveryService for AdsServer<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    type StreamAggregatedResourcesStream = ResponseStream<<Sotw as XdsProtocol>::Response>;
    type DeltaAggregatedResourcesStream = ResponseStream<<Delta as XdsProtocol>::Response>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.stream::<Sotw>(request))
    }

    async fn delta_aggregated_resources(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Ok(self.stream::<Delta>(request))
    }
}

async fn run_stream<P, S, D>(
    session: Arc<ClientSession<P, S, D>>,
    mut requests: Streaming<P::Request>,
    responses: UnboundedSender<Result<P::Response, Status>>,
) where
    P: XdsProtocol,
    P::Request: AccessLog,
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    let client = session.id();

    loop {
        let request = match requests.message().await {
            Ok(Some(msg)) => msg,
            // the stream has ended
            Ok(None) => {
                trace!(%client, "closing stream: client hung up");
                break;
            }
            // the connection is hosed, just bail
            Err(e) if io_source(&e).is_some() => {
                trace!(%client, err = %e, "closing stream: ignoring io error");
                break;
            }
            // something actually went wrong!
            Err(e) => {
                warn!(%client, err = %e, "an unexpected error occurred, closing the stream");
                break;
            }
        };
        request.log(client);

        if let Err(e) = session.handle_request(&request) {
            info!(%client, err = %e, "closing stream: invalid request");
            if responses.send(Err(e.into_status())).is_err() {
                debug!(%client, "response channel closed unexpectedly");
            }
            break;
        }
    }

    if let Err(e) = session.close() {
        warn!(%client, err = %format!("{e:#}"), "failed to cleanly close session");
    }
}

fn ads_service_name<S, D>() -> &'static str
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    <AggregatedDiscoveryServiceServer<AdsServer<S, D>> as NamedService>::NAME
}

fn io_source(status: &Status) -> Option<&std::io::Error> {
    let mut err: &(dyn std::error::Error + 'static) = status;

    loop {
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            return Some(e);
        }

        if let Some(e) = err.downcast_ref::<h2::Error>().and_then(|e| e.get_io()) {
            return Some(e);
        }

        err = err.source()?;
    }
}

/// Serve ADS on `addr` until the server exits.
///
/// The server also serves gRPC reflection for the ADS service and logs every
/// call through [tower_http]'s tracing layer.
pub async fn serve<S, D>(addr: SocketAddr, server: AdsServer<S, D>) -> anyhow::Result<()>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    // register the ADS service name explicitly, so reflection only shows what
    // this server implements instead of every xDS api in the descriptor set.
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET)
        .with_service_name("grpc.reflection.v1alpha.ServerReflection")
        .with_service_name(ads_service_name::<S, D>())
        .build()?;

    let mut server_builder = Server::builder().layer(grpc_access::layer!());
    let router = server_builder
        .add_service(AggregatedDiscoveryServiceServer::new(server))
        .add_service(reflection);

    info!(%addr, "serving ADS");
    router.serve(addr).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_io_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let status = Status::from_error(Box::new(io_err));
        assert_eq!(
            io_source(&status).map(|e| e.kind()),
            Some(std::io::ErrorKind::BrokenPipe)
        );

        let status = Status::internal("potato");
        assert!(io_source(&status).is_none());
    }
}
