use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type StateMachineResult = Result<(), StateMachineError>;

#[derive(Error, Debug)]
pub enum StateMachineError {
    // The payload could not be interpreted. Never skipped: skipping would make
    // this participant diverge from the rest of the cluster.
    #[error("Malformed payload: {0}")]
    Malformed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{0}")]
    Failed(String),
}

// A state machine kept on every server in a raft cluster. The consensus
// implementation applies payloads once they are committed, one at a time and
// in log order. None of these methods are ever called concurrently.
#[async_trait]
pub trait StateMachine {
    // Applies the supplied payload and incorporates it in the state of the
    // state machine. Errors are fatal for the participant.
    async fn apply(&mut self, payload: &Bytes) -> StateMachineResult;

    // Captures the current state. The returned handle must not observe any
    // payloads applied after this call returns.
    async fn create_snapshot(&self) -> Box<dyn Snapshot + Send + Sync>;

    // Replaces the entire state with the contents of the supplied snapshot.
    // Either succeeds completely or leaves the state untouched.
    async fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult;
}

// A point-in-time view of a state machine which can be serialized on demand.
pub trait Snapshot {
    fn persist(&self) -> Result<Bytes, StateMachineError>;
}
