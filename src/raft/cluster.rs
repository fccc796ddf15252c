use async_std::sync::{Arc, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::failure_injection::{ChannelInfo, FailureInjectionMiddleware, FailureOptions};
use crate::raft::raft_common_proto::{ClusterConfig, Member};
use crate::raft::raft_service_proto::raft_client::RaftClient;

pub type PeerClient = RaftClient<FailureInjectionMiddleware<Channel>>;

// Holds information about the other participants of a Raft cluster. Which
// members are part of the cluster is decided by the store's config, this only
// keeps track of how to reach them.
pub struct Cluster {
    me: Member,
    channels: HashMap<String, Channel>,
    last_known_leader: Option<Member>,
    failures: Arc<Mutex<FailureOptions>>,
    rpc_timeout: Duration,
    max_message_bytes: usize,
}

impl Cluster {
    pub fn new(
        me: Member,
        failures: Arc<Mutex<FailureOptions>>,
        rpc_timeout: Duration,
        max_message_bytes: usize,
    ) -> Self {
        Cluster {
            me,
            channels: HashMap::new(),
            last_known_leader: None,
            failures,
            rpc_timeout,
            max_message_bytes,
        }
    }

    // Returns the last known leader of this cluster, if any. This information could
    // be stale.
    pub fn leader(&self) -> Option<Member> {
        self.last_known_leader.clone()
    }

    // Stores the fact that we have observed a new leader.
    pub fn record_leader(&mut self, leader: &Member) {
        self.last_known_leader = Some(leader.clone());
    }

    // Forgets the last known leader, e.g., because a new term started.
    pub fn clear_leader(&mut self) {
        self.last_known_leader = None;
    }

    // Returns the address we are running on.
    pub fn me(&self) -> Member {
        self.me.clone()
    }

    // Returns the voters of the supplied config other than us.
    pub fn others(&self, config: &ClusterConfig) -> Vec<Member> {
        config
            .voters
            .iter()
            .filter(|m| m.id != self.me.id)
            .cloned()
            .collect()
    }

    // Returns an rpc client which can be used to contact the supplied peer.
    // Connections are established lazily on first use.
    pub fn new_client(&mut self, member: &Member) -> RaftResult<PeerClient> {
        let channel = match self.channels.get(&member.address) {
            // Cloning channels is cheap and the recommended way to reuse them.
            Some(channel) => channel.clone(),
            None => {
                let channel = Endpoint::from_shared(format!("http://{}", member.address))
                    .map_err(|e| RaftError::ConnectionFailed {
                        peer: member.id.clone(),
                        source: Box::new(e),
                    })?
                    .connect_timeout(self.rpc_timeout)
                    .timeout(self.rpc_timeout)
                    .connect_lazy();
                self.channels.insert(member.address.clone(), channel.clone());
                channel
            }
        };

        let info = ChannelInfo::new(self.me.id.clone(), member.id.clone());
        Ok(RaftClient::new(FailureInjectionMiddleware::new(
            channel,
            self.failures.clone(),
            info,
        ))
        .max_decoding_message_size(self.max_message_bytes)
        .max_encoding_message_size(self.max_message_bytes))
    }
}
