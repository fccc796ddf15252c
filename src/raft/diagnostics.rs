use std::collections::{BTreeMap, HashMap};

use async_std::sync::{Arc, Mutex};
use tracing::info;

use crate::raft::raft_common_proto::Member;

// Holds information about the execution of a cluster over time. Can be used
// to perform various integrity checks based on the recorded data. For
// instance, there should be no term in the cluster's history where members
// disagree on who is the leader.
pub struct Diagnostics {
    servers: HashMap<String, Arc<Mutex<ServerDiagnostics>>>,
    leaders: BTreeMap<i64, Member>,
}

impl Diagnostics {
    // Returns a new instance which, initially, know about no servers.
    pub fn new() -> Self {
        Diagnostics {
            servers: HashMap::new(),
            leaders: BTreeMap::new(),
        }
    }

    // Returns the ServerDiagnostics object for the supplied member, creating
    // one if necessary.
    pub fn get_server(&mut self, member: &Member) -> Arc<Mutex<ServerDiagnostics>> {
        self.servers
            .entry(member.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerDiagnostics::new())))
            .clone()
    }

    // Returns the leader for the latest term any server has seen a leader for.
    pub async fn latest_leader(&self) -> Option<(i64, Member)> {
        let mut result: Option<(i64, Member)> = None;
        for server in self.servers.values() {
            let s = server.lock().await;
            if let Some((term, leader)) = s.leaders.last_key_value() {
                if result.as_ref().is_none_or(|(t, _)| term > t) {
                    result = Some((*term, leader.clone()));
                }
            }
        }
        result
    }

    // Returns the snapshots installed by the supplied member, if it is known.
    #[cfg(test)]
    pub async fn get_snapshot_installs(&self, id: &str) -> Option<Vec<SnapshotInfo>> {
        match self.servers.get(id) {
            Some(server) => Some(server.lock().await.snapshots.clone()),
            None => None,
        }
    }

    // Performs a set of a sequence of checks on the data recorded by the
    // individual servers. Returns an error if any of the checks fail.
    pub async fn validate(&mut self) -> Result<(), String> {
        self.validate_leaders().await
    }

    // Validates that across the execution history, all servers have a
    // compatible view of who was the leader for every term. Specifically,
    // there should be no term for which two servers recognize different peers
    // as the leader of the cluster.
    async fn validate_leaders(&mut self) -> Result<(), String> {
        let latest = match self.leaders.last_entry() {
            Some(e) => *e.key(),
            None => -1,
        };

        // Only servers which have seen a leader at all take part.
        let mut servers = Vec::new();
        for server in self.servers.values() {
            if server.lock().await.latest_term().is_some() {
                servers.push(server.clone());
            }
        }

        let mut term = latest;
        loop {
            term += 1;

            let mut candidate: Option<Member> = None;
            for server in &servers {
                let s = server.lock().await;
                if s.latest_term().unwrap_or(-1) < term {
                    // This server hasn't seen a leader for this term yet. Stop.
                    return Ok(());
                }

                let leader = match s.leaders.get(&term) {
                    Some(leader) => leader,
                    // This server has seen a leader for a later term, but not this one.
                    None => continue,
                };

                match &candidate {
                    None => candidate = Some(leader.clone()),
                    Some(c) => {
                        if c != leader {
                            return Err(format!(
                                "Incompatible leader for term {}: {} and {}",
                                term, c.id, leader.id
                            ));
                        }
                    }
                }
            }

            // At this point, all servers have moved on to seeing leaders for a future
            // term. Note that we may or may not have an actual leader.
            info!(
                "Validated agreed leader for term {} to be {:?}",
                term, &candidate
            );
            if let Some(c) = candidate {
                self.leaders.insert(term, c);
            }
        }
    }
}

// Information about a snapshot installed by a follower.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub last_index: i64,
    pub size_bytes: usize,
}

// Holds information about a single server's execution as part of a raft
// cluster over time.
pub struct ServerDiagnostics {
    // Keeps track of the leader for each term.
    leaders: BTreeMap<i64, Member>,

    snapshots: Vec<SnapshotInfo>,
}

impl ServerDiagnostics {
    fn new() -> Self {
        ServerDiagnostics {
            leaders: BTreeMap::new(),
            snapshots: Vec::new(),
        }
    }

    // Called when the server acknowledges a leader for the supplied term.
    pub fn report_leader(&mut self, term: i64, leader: &Member) {
        let existing = self.leaders.get(&term);
        assert!(existing.is_none() || existing == Some(leader));
        self.leaders.insert(term, leader.clone());
    }

    // Called when the server installs a snapshot received from a leader.
    pub fn report_snapshot(&mut self, last_index: i64, size_bytes: usize) {
        self.snapshots.push(SnapshotInfo {
            last_index,
            size_bytes,
        });
    }

    fn latest_term(&self) -> Option<i64> {
        self.leaders.last_key_value().map(|(k, _)| *k)
    }
}
