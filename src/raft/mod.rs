pub mod raft_common_proto {
    tonic::include_proto!("raft_common_proto");
}

pub mod raft_service_proto {
    tonic::include_proto!("raft_service_proto");
}

pub mod raft_persistence_proto {
    tonic::include_proto!("raft_persistence_proto");
}

mod error;
pub use error::RaftError;
#[cfg(test)]
pub use error::RaftResult;

mod log;
mod persistence;
mod store;

mod client;
pub use client::{Client, ClusterStatus, Role};

mod cluster;

mod consensus;
pub use consensus::{Options, RaftImpl};

mod diagnostics;
pub use diagnostics::{Diagnostics, ServerDiagnostics};
#[cfg(test)]
pub use diagnostics::SnapshotInfo;

mod failure_injection;
pub use failure_injection::FailureOptions;

mod state_machine;
pub use state_machine::{Snapshot, StateMachine, StateMachineError, StateMachineResult};

#[cfg(test)]
mod testing;
