use tonic::{Request, Response, Status};
use tracing::debug;

use crate::keyvalue::keyvalue_proto::cluster_server::Cluster;
use crate::keyvalue::keyvalue_proto::{
    JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Peer, StatusRequest, StatusResponse,
};
use crate::keyvalue::service::KeyValueService;
use crate::raft::raft_common_proto::Member;

fn peer(member: &Member) -> Peer {
    Peer {
        id: member.id.clone(),
        address: member.address.clone(),
    }
}

#[tonic::async_trait]
impl Cluster for KeyValueService {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let status = KeyValueService::status(self).await?;
        Ok(Response::new(StatusResponse {
            leader: status.leader.as_ref().map(peer),
            peers: status.members.iter().map(peer).collect(),
            role: status.role.to_string(),
            term: status.term,
        }))
    }

    async fn join(&self, request: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let request = request.into_inner();
        debug!("Handling join request for {} ({})", request.id, request.address);
        KeyValueService::join(self, &request.id, &request.address).await?;
        Ok(Response::new(JoinResponse {}))
    }

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> Result<Response<LeaveResponse>, Status> {
        let request = request.into_inner();
        debug!("Handling leave request for {}", request.id);
        KeyValueService::leave(self, &request.id).await?;
        Ok(Response::new(LeaveResponse {}))
    }
}
