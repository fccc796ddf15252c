use async_std::sync::Arc;
use bytes::Bytes;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::keyvalue::command::Command;
use crate::keyvalue::error::{KeyValueError, KeyValueResult};
use crate::keyvalue::keyvalue_proto::key_value_server::KeyValue;
use crate::keyvalue::keyvalue_proto::{
    DeleteRequest, DeleteResponse, GetRequest, GetResponse, SetRequest, SetResponse,
};
use crate::keyvalue::store::{MapStore, Store};
use crate::raft::raft_common_proto::Member;
use crate::raft::{Client, ClusterStatus, Role};

// Serves reads from the local store and funnels writes and membership changes
// through the raft participant running on the same node.
pub struct KeyValueService {
    name: String,
    store: Arc<MapStore>,
    raft: Arc<dyn Client + Send + Sync>,

    // How long writes wait for their entry to be applied.
    commit_timeout: Duration,
}

impl KeyValueService {
    // Creates a new instance of the service. The supplied store must be the
    // one the raft participant applies committed commands to.
    pub fn new(
        name: &str,
        store: Arc<MapStore>,
        raft: Arc<dyn Client + Send + Sync>,
        commit_timeout: Duration,
    ) -> Self {
        KeyValueService {
            name: name.to_string(),
            store,
            raft,
            commit_timeout,
        }
    }

    // Replicates the supplied command. Only succeeds on the leader, and only
    // once the command has been applied locally.
    pub async fn write(&self, command: Command) -> KeyValueResult<()> {
        self.check_available().await?;
        if command.key().is_empty() {
            return Err(KeyValueError::InvalidArgument("Empty key".to_string()));
        }
        if self.raft.role().await != Role::Leader {
            return Err(KeyValueError::NotLeader {
                leader: self.raft.status().await.leader,
            });
        }

        let key = String::from_utf8_lossy(command.key()).to_string();
        match self.raft.commit(command.encode(), self.commit_timeout).await {
            Ok(id) => {
                info!(key = %key, index = id.index, "[{}] Committed write", self.name);
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, "[{}] Failed to commit write: {}", self.name, e);
                Err(e.into())
            }
        }
    }

    // Returns the locally applied value of the supplied key. Followers may
    // serve stale values.
    pub async fn read(&self, key: &[u8]) -> KeyValueResult<Bytes> {
        self.check_available().await?;
        if key.is_empty() {
            return Err(KeyValueError::InvalidArgument("Empty key".to_string()));
        }
        self.store
            .get(key)
            .await
            .ok_or_else(|| KeyValueError::NotFound { key: key.to_vec() })
    }

    pub async fn status(&self) -> KeyValueResult<ClusterStatus> {
        self.check_available().await?;
        Ok(self.raft.status().await)
    }

    // Adds a new voting member to the cluster.
    pub async fn join(&self, id: &str, address: &str) -> KeyValueResult<()> {
        self.check_available().await?;
        if id.is_empty() || address.is_empty() {
            return Err(KeyValueError::InvalidArgument(
                "Both id and address are required".to_string(),
            ));
        }

        let status = self.raft.status().await;
        if let Some(existing) = status
            .members
            .iter()
            .find(|m| m.id == id || m.address == address)
        {
            return Err(KeyValueError::AlreadyExists {
                id: existing.id.clone(),
                address: existing.address.clone(),
            });
        }

        let member = Member {
            id: id.to_string(),
            address: address.to_string(),
        };
        self.raft.add_member(member, self.commit_timeout).await?;
        info!("[{}] Member {} ({}) joined", self.name, id, address);
        Ok(())
    }

    // Removes a voting member from the cluster.
    pub async fn leave(&self, id: &str) -> KeyValueResult<()> {
        self.check_available().await?;
        let status = self.raft.status().await;
        if !status.members.iter().any(|m| m.id == id) {
            return Err(KeyValueError::MemberNotFound { id: id.to_string() });
        }

        self.raft.remove_member(id, self.commit_timeout).await?;
        info!("[{}] Member {} left", self.name, id);
        Ok(())
    }

    // A participant which stopped can no longer vouch for the state it holds.
    async fn check_available(&self) -> KeyValueResult<()> {
        match self.raft.halted().await {
            Some(reason) => Err(KeyValueError::Unavailable(reason)),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl KeyValue for KeyValueService {
    async fn set(&self, request: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        debug!("[{}] Handling SET request", self.name);
        let request = request.into_inner();
        self.write(Command::set(request.key, request.value)).await?;
        Ok(Response::new(SetResponse {}))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        debug!("[{}] Handling GET request", self.name);
        let value = self.read(&request.into_inner().key).await?;
        Ok(Response::new(GetResponse {
            value: value.to_vec(),
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        debug!("[{}] Handling DELETE request", self.name);
        self.write(Command::delete(request.into_inner().key)).await?;
        Ok(Response::new(DeleteResponse {}))
    }
}
