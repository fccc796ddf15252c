use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::raft::error::RaftResult;
use crate::raft::raft_common_proto::{EntryId, Member};

// The role a participant currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// A participant's view of the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStatus {
    pub role: Role,
    pub term: i64,

    // The last known leader, which is this participant if it leads.
    pub leader: Option<Member>,

    // The voting members of the config currently in effect.
    pub members: Vec<Member>,

    pub committed: i64,
    pub applied: i64,
}

// The interface a local participant offers to the service running on top of
// it. All operations which change the log must be called on the leader.
#[async_trait]
pub trait Client {
    async fn role(&self) -> Role;

    // Adds the supplied payload as the next entry in the cluster's shared log.
    // Returns once the entry has been applied locally, or fails if this does
    // not happen within the supplied timeout. A timeout leaves the outcome
    // unknown: the entry may still commit later.
    async fn commit(&self, payload: Bytes, timeout: Duration) -> RaftResult<EntryId>;

    async fn status(&self) -> ClusterStatus;

    // Adds a voting member to the cluster. Returns once the new config has
    // been applied locally.
    async fn add_member(&self, member: Member, timeout: Duration) -> RaftResult<()>;

    // Removes the voting member with the supplied id.
    async fn remove_member(&self, id: &str, timeout: Duration) -> RaftResult<()>;

    // Returns the reason this participant stopped, if it did.
    async fn halted(&self) -> Option<String>;
}
