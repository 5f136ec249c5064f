//! The tonic service adapter over [`Gateway`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use rill_core::proto;
use rill_core::proto::capture_gateway_server::{CaptureGateway, CaptureGatewayServer};

use crate::session::Gateway;

/// Response-channel depth. A full channel suspends the forwarder, which
/// propagates backpressure to the live feed.
const OUTBOUND_BUFFER: usize = 64;

/// gRPC front of the capture gateway.
pub struct CaptureService {
    gateway: Arc<Gateway>,
}

impl CaptureService {
    /// Wraps a gateway for serving.
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        CaptureService {
            gateway: Arc::new(gateway),
        }
    }
}

#[tonic::async_trait]
impl CaptureGateway for CaptureService {
    type CaptureStream = ReceiverStream<Result<proto::CaptureMessage, Status>>;

    async fn capture(
        &self,
        request: Request<Streaming<proto::CaptureRequest>>,
    ) -> Result<Response<Self::CaptureStream>, Status> {
        let mut requests = request.into_inner();
        let session = self
            .gateway
            .open_session(&mut requests)
            .await
            .map_err(Status::from)?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(async move {
            if let Err(error) = session.run(requests, tx).await {
                debug!(%error, "capture session ended");
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Binds the capture gateway on `addr` and serves until shutdown.
///
/// # Errors
///
/// Returns the transport error when binding or serving fails.
pub async fn serve(addr: SocketAddr, gateway: Gateway) -> Result<(), tonic::transport::Error> {
    info!(%addr, "starting capture gateway");
    tonic::transport::Server::builder()
        .add_service(CaptureGatewayServer::new(CaptureService::new(gateway)))
        .serve(addr)
        .await
}
