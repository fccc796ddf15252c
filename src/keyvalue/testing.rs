use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::keyvalue::state_machine::KeyValueStateMachine;
use crate::keyvalue::store::MapStore;
use crate::raft::raft_common_proto::{EntryId, Member};
use crate::raft::{Client, ClusterStatus, RaftError, RaftResult, Role, StateMachine};

// A fake client which applies commits straight to the supplied store rather
// than going through consensus. Tracks membership in memory.
pub struct FakeRaftClient {
    pub role: Mutex<Role>,
    pub leader: Mutex<Option<Member>>,
    pub members: Mutex<Vec<Member>>,
    pub halted: Mutex<Option<String>>,

    // When set, commits fail as if they didn't make it in time.
    pub time_out: Mutex<bool>,

    machine: Mutex<KeyValueStateMachine>,
    index: Mutex<i64>,
}

impl FakeRaftClient {
    pub fn new(store: Arc<MapStore>, me: Member) -> Self {
        FakeRaftClient {
            role: Mutex::new(Role::Leader),
            leader: Mutex::new(Some(me.clone())),
            members: Mutex::new(vec![me]),
            halted: Mutex::new(None),
            time_out: Mutex::new(false),
            machine: Mutex::new(KeyValueStateMachine::new(store)),
            index: Mutex::new(0),
        }
    }

    pub async fn demote(&self, leader: Option<Member>) {
        *self.role.lock().await = Role::Follower;
        *self.leader.lock().await = leader;
    }

    async fn check_leader(&self) -> RaftResult<()> {
        if let Some(reason) = self.halted.lock().await.clone() {
            return Err(RaftError::Halted(reason));
        }
        if *self.role.lock().await != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader.lock().await.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Client for FakeRaftClient {
    async fn role(&self) -> Role {
        *self.role.lock().await
    }

    async fn commit(&self, payload: Bytes, _timeout: Duration) -> RaftResult<EntryId> {
        self.check_leader().await?;
        let mut index = self.index.lock().await;
        if *self.time_out.lock().await {
            return Err(RaftError::CommitTimeout { index: *index });
        }
        self.machine.lock().await.apply(&payload).await?;
        *index += 1;
        Ok(EntryId {
            term: 1,
            index: *index,
        })
    }

    async fn status(&self) -> ClusterStatus {
        ClusterStatus {
            role: *self.role.lock().await,
            term: 1,
            leader: self.leader.lock().await.clone(),
            members: self.members.lock().await.clone(),
            committed: *self.index.lock().await,
            applied: *self.index.lock().await,
        }
    }

    async fn add_member(&self, member: Member, _timeout: Duration) -> RaftResult<()> {
        self.check_leader().await?;
        let mut members = self.members.lock().await;
        if members
            .iter()
            .any(|m| m.id == member.id || m.address == member.address)
        {
            return Err(RaftError::MemberExists {
                id: member.id,
                address: member.address,
            });
        }
        members.push(member);
        Ok(())
    }

    async fn remove_member(&self, id: &str, _timeout: Duration) -> RaftResult<()> {
        self.check_leader().await?;
        let mut members = self.members.lock().await;
        if !members.iter().any(|m| m.id == id) {
            return Err(RaftError::MemberNotFound(id.to_string()));
        }
        members.retain(|m| m.id != id);
        Ok(())
    }

    async fn halted(&self) -> Option<String> {
        self.halted.lock().await.clone()
    }
}
