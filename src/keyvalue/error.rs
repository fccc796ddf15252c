use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tonic::Status;

use crate::keyvalue::command::CodecError;
use crate::raft::RaftError;
use crate::raft::raft_common_proto::Member;

pub type KeyValueResult<T> = Result<T, KeyValueError>;

// Errors surfaced to clients of the key-value store.
#[derive(Error, Debug)]
pub enum KeyValueError {
    #[error("Key not found: {}", String::from_utf8_lossy(.key))]
    NotFound { key: Vec<u8> },

    #[error("Not the leader, leader is {}", describe_leader(.leader))]
    NotLeader { leader: Option<Member> },

    #[error("Member {id} ({address}) is already part of the cluster")]
    AlreadyExists { id: String, address: String },

    #[error("Member {id} is not part of the cluster")]
    MemberNotFound { id: String },

    #[error("Encoding error: {0}")]
    Encoding(#[from] CodecError),

    #[error("Commit did not complete in time, outcome unknown")]
    CommitTimeout,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl KeyValueError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            KeyValueError::NotFound { .. } | KeyValueError::MemberNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            // Clients are expected to retry against the leader.
            KeyValueError::NotLeader { .. } => StatusCode::PRECONDITION_FAILED,
            KeyValueError::AlreadyExists { .. } => StatusCode::CONFLICT,
            KeyValueError::CommitTimeout => StatusCode::GATEWAY_TIMEOUT,
            KeyValueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KeyValueError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            KeyValueError::Encoding(_) | KeyValueError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<RaftError> for KeyValueError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader } => KeyValueError::NotLeader { leader },
            RaftError::CommitTimeout { .. } => KeyValueError::CommitTimeout,
            RaftError::MemberExists { id, address } => KeyValueError::AlreadyExists { id, address },
            RaftError::MemberNotFound(id) => KeyValueError::MemberNotFound { id },
            RaftError::InvalidArgument(message) => KeyValueError::InvalidArgument(message),
            e @ (RaftError::Halted(_) | RaftError::ConfigChangeInProgress { .. }) => {
                KeyValueError::Unavailable(e.to_string())
            }
            other => KeyValueError::Internal(other.to_string()),
        }
    }
}

impl From<KeyValueError> for Status {
    fn from(err: KeyValueError) -> Self {
        let message = err.to_string();
        match err {
            KeyValueError::NotFound { .. } | KeyValueError::MemberNotFound { .. } => {
                Status::not_found(message)
            }
            KeyValueError::NotLeader { .. } => Status::failed_precondition(message),
            KeyValueError::AlreadyExists { .. } => Status::already_exists(message),
            KeyValueError::CommitTimeout => Status::deadline_exceeded(message),
            KeyValueError::Unavailable(_) => Status::unavailable(message),
            KeyValueError::InvalidArgument(_) => Status::invalid_argument(message),
            KeyValueError::Encoding(_) | KeyValueError::Internal(_) => Status::internal(message),
        }
    }
}

impl IntoResponse for KeyValueError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.http_status(), Json(body)).into_response()
    }
}

fn describe_leader(leader: &Option<Member>) -> String {
    match leader {
        Some(member) => format!("{} ({})", member.id, member.address),
        None => "unknown".to_string(),
    }
}
