//! gRPC facade exposing the consensus RPCs to peers.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::consensus::RaftNode;
use crate::proto::raft_transport_server::{RaftTransport, RaftTransportServer};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

/// gRPC service for internal consensus communication
pub struct TransportService {
    raft: Arc<RaftNode>,
}

impl TransportService {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftTransport for TransportService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(candidate = %req.candidate_id, term = req.term, "received RequestVote");

        let node = self.raft.clone();
        let result = AssertUnwindSafe(async { node.handle_vote_request(req).await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => Ok(Response::new(response)),
            Ok(Err(e)) => Err(Status::internal(format!("RequestVote handler error: {e}"))),
            Err(_) => {
                tracing::error!("panic in RequestVote handler");
                Err(Status::internal("internal error in RequestVote handler"))
            }
        }
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = %req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat = req.entries.is_empty(),
            "received AppendEntries"
        );

        let node = self.raft.clone();
        let result = AssertUnwindSafe(async { node.handle_append_entries(req).await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => Ok(Response::new(response)),
            Ok(Err(e)) => Err(Status::internal(format!(
                "AppendEntries handler error: {e}"
            ))),
            Err(_) => {
                tracing::error!("panic in AppendEntries handler");
                Err(Status::internal("internal error in AppendEntries handler"))
            }
        }
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(
            leader = %req.leader_id,
            term = req.term,
            last_included_index = req.last_included_index,
            "received InstallSnapshot"
        );

        let node = self.raft.clone();
        let result = AssertUnwindSafe(async { node.handle_install_snapshot(req).await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => Ok(Response::new(response)),
            Ok(Err(e)) => Err(Status::internal(format!(
                "InstallSnapshot handler error: {e}"
            ))),
            Err(_) => {
                tracing::error!("panic in InstallSnapshot handler");
                Err(Status::internal("internal error in InstallSnapshot handler"))
            }
        }
    }
}

/// Serve the consensus transport until the shutdown token fires.
pub async fn serve(
    addr: SocketAddr,
    raft: Arc<RaftNode>,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    tracing::info!(addr = %addr, "starting consensus transport");
    Server::builder()
        .add_service(RaftTransportServer::new(TransportService::new(raft)))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
}
