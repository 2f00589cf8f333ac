//! Minimal gRPC client for the relay's server-streaming `GetFlows` RPC.

use http::uri::PathAndQuery;
use tonic::{
    Request, Response, Status,
    client::Grpc,
    codec::{ProstCodec, Streaming},
    transport::{Channel, Endpoint},
};

use crate::proto::{GetFlowsRequest, GetFlowsResponse};

#[derive(Clone, Debug)]
pub struct ObserverClient {
    inner: Grpc<Channel>,
}

impl ObserverClient {
    /// Connects to the relay at `address` (e.g. `http://hubble-relay:4245`).
    pub async fn connect(address: String) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(address)?.connect().await?;
        Ok(Self {
            inner: Grpc::new(channel),
        })
    }

    pub async fn get_flows(
        &mut self,
        request: GetFlowsRequest,
    ) -> Result<Response<Streaming<GetFlowsResponse>>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("flow relay is not ready: {e}")))?;
        let codec: ProstCodec<GetFlowsRequest, GetFlowsResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/observer.Observer/GetFlows");
        self.inner
            .server_streaming(Request::new(request), path, codec)
            .await
    }
}
