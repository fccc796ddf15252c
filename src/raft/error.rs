use thiserror::Error;
use tonic::Status;

use crate::raft::persistence::PersistenceError;
use crate::raft::raft_common_proto::Member;
use crate::raft::state_machine::StateMachineError;

/// A specialized `Result` type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Structured error type used throughout the raft package.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Failed to connect to peer {peer}: {source}")]
    ConnectionFailed {
        peer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid argument in request: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Non-contiguous log entries supplied. Expected index {expected}, got {actual}")]
    NonContiguousLog { expected: i64, actual: i64 },

    #[error("Not the leader, last known leader: {}", describe_leader(.leader))]
    NotLeader { leader: Option<Member> },

    #[error("Entry at index {index} was not committed within the timeout, outcome unknown")]
    CommitTimeout { index: i64 },

    #[error("Entry at index {index} was replaced by a different entry before committing")]
    Superseded { index: i64 },

    #[error("A previous membership change (index {index}) has not committed yet")]
    ConfigChangeInProgress { index: i64 },

    #[error("Member {id} ({address}) is already part of the cluster")]
    MemberExists { id: String, address: String },

    #[error("Member {0} is not part of the cluster")]
    MemberNotFound(String),

    #[error("Participant halted: {0}")]
    Halted(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("State machine failure: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl RaftError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidArgument(format!("Missing field {}", field))
    }
}

/// Conversion from our internal `RaftError` to a gRPC `Status`. Used by the
/// peer-facing raft service.
impl From<RaftError> for Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::InvalidArgument(msg) => Status::invalid_argument(msg),
            RaftError::Halted(_) => Status::unavailable(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

fn describe_leader(leader: &Option<Member>) -> String {
    match leader {
        Some(member) => format!("{} ({})", member.id, member.address),
        None => "unknown".to_string(),
    }
}
