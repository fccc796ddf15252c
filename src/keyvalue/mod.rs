// This module provides a key-value store backed by a raft cluster. The store
// is exposed as grpc services (data and cluster management) and as a small
// REST api, all of which are served by every node.

pub use http::HttpHandler;
pub use service::KeyValueService;
pub use state_machine::KeyValueStateMachine;
pub use store::MapStore;

pub mod grpc {
    pub use crate::keyvalue::keyvalue_proto::cluster_client::ClusterClient;
    pub use crate::keyvalue::keyvalue_proto::cluster_server::ClusterServer;
    pub use crate::keyvalue::keyvalue_proto::key_value_client::KeyValueClient;
    pub use crate::keyvalue::keyvalue_proto::key_value_server::KeyValueServer;
    pub use crate::keyvalue::keyvalue_proto::{
        DeleteRequest, GetRequest, JoinRequest, LeaveRequest, SetRequest, StatusRequest,
    };
}

pub mod keyvalue_proto {
    tonic::include_proto!("keyvalue_proto");
}

mod cluster;
mod command;
mod error;
mod http;
mod service;
mod state_machine;
mod store;

#[cfg(test)]
mod testing;
