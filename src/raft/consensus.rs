use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tonic::{Request, Response, Status};
use tracing::{Instrument, debug, error, info, warn};

use crate::raft::client::{Client, ClusterStatus, Role};
use crate::raft::cluster::{Cluster, PeerClient};
use crate::raft::diagnostics::ServerDiagnostics;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::failure_injection::FailureOptions;
use crate::raft::persistence::{FilePersistenceOptions, PersistenceOptions};
use crate::raft::raft_common_proto::entry::Data;
use crate::raft::raft_common_proto::{ClusterConfig, EntryId, Member, Noop};
use crate::raft::raft_service_proto::raft_server::Raft;
use crate::raft::raft_service_proto::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::raft::state_machine::StateMachine;
use crate::raft::store::{AppendOutcome, ConfigInfo, Store};

const DEFAULT_FOLLOWER_TIMEOUT_MS: u64 = 2000;
const DEFAULT_CANDIDATE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_LEADER_REPLICATE_MS: u64 = 500;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 1000;
const DEFAULT_COMPACTION_THRESHOLD_BYTES: i64 = 1000 * 1000 * 10;
const DEFAULT_MAX_ENTRIES_PER_APPEND: usize = 100;
const DEFAULT_MAX_APPEND_BYTES: i64 = 1024 * 1024;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

// Parameters used to configure the behavior of a cluster participant.
#[derive(Debug, Clone)]
pub struct Options {
    // Where the participant keeps the state it needs to survive restarts.
    persistence: PersistenceOptions,

    // Log size above which the participant folds the applied prefix of its log
    // into a snapshot.
    compaction_threshold_bytes: i64,

    // Timeout after which a server in follower state starts a new election.
    follower_timeout_ms: u64,

    // Timeout after which a server in candidate state declares its candidacy a
    // failure and starts a new election.
    candidate_timeout_ms: u64,

    // How frequently a leader will wake up and replicate entries to followers.
    // Note that this also serves as the leader's heartbeat, so this should be
    // lower than the follower timeout.
    leader_replicate_ms: u64,

    // Deadline for individual rpcs to peers.
    rpc_timeout_ms: u64,

    max_entries_per_append: usize,

    // Payload budget for a single append request.
    max_append_bytes: i64,

    // Largest peer rpc message accepted or sent. Snapshots travel as a single
    // message, so this bounds the size of the state that can be replicated.
    max_message_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            persistence: PersistenceOptions::NoPersistenceForTesting,
            compaction_threshold_bytes: DEFAULT_COMPACTION_THRESHOLD_BYTES,
            follower_timeout_ms: DEFAULT_FOLLOWER_TIMEOUT_MS,
            candidate_timeout_ms: DEFAULT_CANDIDATE_TIMEOUT_MS,
            leader_replicate_ms: DEFAULT_LEADER_REPLICATE_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            max_entries_per_append: DEFAULT_MAX_ENTRIES_PER_APPEND,
            max_append_bytes: DEFAULT_MAX_APPEND_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Options {
    // Returns options which keep all state in memory only.
    pub fn new_without_persistence_for_testing() -> Self {
        Options::default()
    }

    // Returns options which persist state to files in the supplied directory.
    pub fn with_persistence(self, directory: &str, wipe: bool) -> Self {
        Options {
            persistence: PersistenceOptions::FilePersistence(FilePersistenceOptions {
                directory: directory.to_string(),
                wipe,
            }),
            ..self
        }
    }

    pub fn with_compaction(self, compaction_threshold_bytes: i64) -> Self {
        Options {
            compaction_threshold_bytes,
            ..self
        }
    }

    pub fn with_timeouts(
        self,
        follower_timeout_ms: u64,
        candidate_timeout_ms: u64,
        leader_replicate_ms: u64,
    ) -> Self {
        Options {
            follower_timeout_ms,
            candidate_timeout_ms,
            leader_replicate_ms,
            ..self
        }
    }

    pub fn with_rpc_timeout(self, rpc_timeout_ms: u64) -> Self {
        Options {
            rpc_timeout_ms,
            ..self
        }
    }

    pub fn with_max_message_bytes(self, max_message_bytes: usize) -> Self {
        Options {
            max_message_bytes,
            ..self
        }
    }

    // The message size limit the peer-facing raft server must be set up with.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }
}

// Canonical implementation of the raft service. Acts as one server among peers
// which form a cluster.
pub struct RaftImpl {
    address: Member,
    state: Arc<Mutex<RaftState>>,
}

impl RaftImpl {
    // Creates a participant with the supplied identity. If nothing has been
    // persisted yet, the participant starts out with "initial_config" as the
    // set of voters. Joining participants start with an empty config and learn
    // the real one from the leader.
    pub async fn new(
        address: &Member,
        initial_config: ClusterConfig,
        state_machine: Arc<Mutex<dyn StateMachine + Send + Sync>>,
        diagnostics: Option<Arc<Mutex<ServerDiagnostics>>>,
        options: Options,
        failures: Arc<Mutex<FailureOptions>>,
    ) -> RaftResult<RaftImpl> {
        let store = Store::new(
            options.persistence.clone(),
            state_machine,
            options.compaction_threshold_bytes,
            address.id.as_str(),
            initial_config,
        )
        .await?;

        let rpc_timeout = Duration::from_millis(options.rpc_timeout_ms);
        let max_message_bytes = options.max_message_bytes;
        Ok(RaftImpl {
            address: address.clone(),
            state: Arc::new(Mutex::new(RaftState {
                options,
                store,
                role: Role::Follower,
                followers: HashMap::new(),
                cluster: Cluster::new(address.clone(), failures, rpc_timeout, max_message_bytes),
                timer_guard: None,
                diagnostics,
                halted: None,
            })),
        })
    }

    // Starts the election timer. Until this is called the participant only
    // reacts to rpcs.
    pub async fn start(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        info!(
            "[{}] Starting in term {} with config {:?}",
            self.address.id,
            state.store.term(),
            state.store.current_config().voters
        );
        state.role = Role::Follower;
        state.reset_election_timer(self.state.clone());
    }

    // Stops all background activity. Rpcs and client operations fail from
    // here on.
    pub async fn halt(&self, reason: &str) {
        self.state.lock().await.halt(reason);
    }

    // Proposes a new entry computed from the config currently in effect and
    // waits for it to be applied.
    async fn submit<F>(&self, make_data: F, timeout: Duration) -> RaftResult<EntryId>
    where
        F: FnOnce(&ConfigInfo) -> RaftResult<Data> + Send,
    {
        let (receiver, entry_id) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.check_halted()?;
            if state.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader: state.cluster.leader(),
                });
            }

            let data = make_data(&state.store.get_config_info())?;
            let term = state.store.term();
            let result = state.store.append(term, data).await;
            let entry_id = state.fatal(result)?;
            let receiver = state.store.add_listener(entry_id.clone());

            // A single voter can commit right away, everyone else needs
            // followers to catch up first.
            update_committed(state, self.state.clone(), term).await;
            spawn_replication(self.state.clone(), term);
            (receiver, entry_id)
        };

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => Err(RaftError::CommitTimeout {
                index: entry_id.index,
            }),
            Ok(Err(_)) => Err(RaftError::Internal(format!(
                "Lost track of entry {}, outcome unknown",
                entry_id.index
            ))),
            Ok(Ok(result)) => result,
        }
    }
}

// Holds the state a cluster leader tracks about its followers. Used to decide
// which entries to replicate to the follower.
#[derive(Debug, Clone, PartialEq)]
struct FollowerPosition {
    // Next log entry to send to the follower.
    next_index: i64,

    // Highest index known to be replicated on the follower.
    match_index: i64,
}

// Aborts the timer task when dropped, so that replacing or clearing the guard
// cancels the pending timeout.
struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RaftState {
    options: Options,

    // Persistent raft state along with the state machine.
    store: Store,

    role: Role,
    followers: HashMap<String, FollowerPosition>,

    // Cluster membership.
    cluster: Cluster,

    timer_guard: Option<TimerGuard>,

    // If present, this instance will inform the diagnostics object of relevant
    // updates as they happen during execution.
    diagnostics: Option<Arc<Mutex<ServerDiagnostics>>>,

    // Set once the participant stopped, never cleared.
    halted: Option<String>,
}

impl RaftState {
    fn name(&self) -> String {
        self.cluster.me().id
    }

    fn check_halted(&self) -> RaftResult<()> {
        match &self.halted {
            Some(reason) => Err(RaftError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    // Stops all activity of this participant.
    fn halt(&mut self, reason: &str) {
        if self.halted.is_some() {
            return;
        }
        error!("[{}] Halting: {}", self.name(), reason);
        self.halted = Some(reason.to_string());
        self.timer_guard = None;
        self.role = Role::Follower;
        self.followers.clear();
        self.store.cancel_listeners(reason);
    }

    // Halts if the supplied result is an error. Failing to persist or to apply
    // committed entries leaves this participant unable to continue safely.
    fn fatal<T>(&mut self, result: RaftResult<T>) -> RaftResult<T> {
        if let Err(e) = &result {
            self.halt(&e.to_string());
        }
        result
    }

    fn is_voter(&self, id: &str) -> bool {
        self.store
            .current_config()
            .voters
            .iter()
            .any(|m| m.id == id)
    }

    fn is_leader_for(&self, term: i64) -> bool {
        self.halted.is_none() && self.role == Role::Leader && self.store.term() == term
    }

    // (Re)arms the timer which starts an election unless it gets reset in time.
    fn reset_election_timer(&mut self, arc_state: Arc<Mutex<RaftState>>) {
        if self.halted.is_some() {
            return;
        }
        let timeout = Duration::from_millis(add_jitter(self.options.follower_timeout_ms));
        let term = self.store.term();
        self.timer_guard = Some(spawn_election_timer(arc_state, term, timeout));
    }

    async fn report_leader(&self, term: i64, leader: &Member) {
        if let Some(d) = &self.diagnostics {
            d.lock().await.report_leader(term, leader);
        }
    }

    // Returns the next request to send to this follower. Must only be called
    // while assuming the role of leader for the cluster.
    fn create_replication_request(
        &self,
        position: &FollowerPosition,
        term: i64,
    ) -> ReplicationRequest {
        let next_index = position.next_index.clamp(0, self.store.next_index());
        let previous_index = next_index - 1;
        let snapshot = self.store.get_latest_snapshot();

        // The follower needs entries we no longer have.
        if previous_index < snapshot.last.index {
            return ReplicationRequest::Snapshot(InstallSnapshotRequest {
                term,
                leader: Some(self.cluster.me()),
                last: Some(snapshot.last),
                config: Some(snapshot.config),
                snapshot: snapshot.snapshot.to_vec(),
            });
        }

        ReplicationRequest::Append(AppendRequest {
            term,
            leader: Some(self.cluster.me()),
            previous: Some(self.store.entry_id_at_index(previous_index)),
            entries: self
                .store
                .get_entries_after(
                    previous_index,
                    self.options.max_entries_per_append,
                    self.options.max_append_bytes,
                ),
            committed: self.store.committed_index(),
        })
    }

    // Incorporates the provided response. Must only be called for responses
    // with a valid term.
    fn handle_replication_response(&mut self, peer: &Member, response: &ReplicationResponse) {
        let name = self.name();
        let f = match self.followers.get_mut(&peer.id) {
            Some(f) => f,
            None => {
                debug!("[{}] Ignoring response from unknown peer {}", name, peer.id);
                return;
            }
        };

        let old = f.clone();
        match response {
            ReplicationResponse::Append { last, response } if response.success => {
                f.match_index = f.match_index.max(*last);
                f.next_index = f.match_index + 1;
            }
            ReplicationResponse::Append { response, .. } => {
                // The follower could not find the entry we sent as "previous".
                // Back off to what it asks for, but always make progress.
                f.next_index = response.next_index.min(f.next_index - 1).max(0);
            }
            ReplicationResponse::Snapshot { last, .. } => {
                f.match_index = f.match_index.max(*last);
                f.next_index = f.match_index + 1;
            }
        }

        if *f != old {
            debug!(
                "[{}] Follower state for peer {} is now (next={},match={})",
                name, peer.id, f.next_index, f.match_index
            );
        }
    }
}

enum ReplicationRequest {
    Append(AppendRequest),
    Snapshot(InstallSnapshotRequest),
}

enum ReplicationResponse {
    // Holds the index of the last entry covered by the request.
    Append { last: i64, response: AppendResponse },
    Snapshot {
        last: i64,
        response: InstallSnapshotResponse,
    },
}

impl ReplicationResponse {
    fn term(&self) -> i64 {
        match self {
            ReplicationResponse::Append { response, .. } => response.term,
            ReplicationResponse::Snapshot { response, .. } => response.term,
        }
    }
}

// Sends a single request to a follower.
async fn replicate_to(
    mut client: PeerClient,
    request: ReplicationRequest,
) -> Result<ReplicationResponse, Status> {
    match request {
        ReplicationRequest::Append(request) => {
            let previous = request.previous.as_ref().map_or(-1, |p| p.index);
            let last = previous + request.entries.len() as i64;
            let response = client.append(request).await?.into_inner();
            Ok(ReplicationResponse::Append { last, response })
        }
        ReplicationRequest::Snapshot(request) => {
            let last = request.last.as_ref().map_or(-1, |l| l.index);
            let response = client.install_snapshot(request).await?.into_inner();
            Ok(ReplicationResponse::Snapshot { last, response })
        }
    }
}

// Moves to follower state for the supplied term, which must not be lower than
// our current term.
async fn become_follower(
    state: &mut RaftState,
    arc_state: Arc<Mutex<RaftState>>,
    term: i64,
) -> RaftResult<()> {
    let current = state.store.term();
    if term < current {
        return Err(RaftError::Internal(format!(
            "Term should never decrease, {} to {}",
            current, term
        )));
    }
    if term > current {
        info!("[{}] Becoming follower for term {}", state.name(), term);
        let result = state.store.update_term_info(term, &None).await;
        state.fatal(result)?;
        state.cluster.clear_leader();
    }
    state.role = Role::Follower;
    state.followers.clear();
    state.reset_election_timer(arc_state);
    Ok(())
}

// Keeps running elections until either the term changes, a leader has emerged,
// or an own election has been won.
async fn election_loop(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    let timeout_ms = arc_state.lock().await.options.candidate_timeout_ms;
    let mut term = term;
    let mut first = true;
    while !run_election(arc_state.clone(), term, first).await {
        first = false;
        term += 1;
        sleep(Duration::from_millis(add_jitter(timeout_ms))).await;
    }
}

// Returns whether or not the election process is deemed complete. If complete,
// there is no need to run any further elections.
async fn run_election(arc_state: Arc<Mutex<RaftState>>, term: i64, first: bool) -> bool {
    let (name, request, peers) = {
        let mut guard = arc_state.lock().await;
        let state = &mut *guard;
        let name = state.name();

        // The world has moved on, e.g., a leader showed up while we waited.
        if state.halted.is_some() || state.store.term() >= term {
            return true;
        }
        let expected_role = if first { Role::Follower } else { Role::Candidate };
        if state.role != expected_role {
            return true;
        }

        let me = state.cluster.me();
        if !state.is_voter(&me.id) {
            debug!("[{}] Not a voter, not starting an election", name);
            state.role = Role::Follower;
            state.reset_election_timer(arc_state.clone());
            return true;
        }

        // Prepare the election.
        info!("[{}] Starting election for term {}", name, term);
        state.role = Role::Candidate;
        let result = state.store.update_term_info(term, &Some(me.clone())).await;
        if state.fatal(result).is_err() {
            return true;
        }
        state.cluster.clear_leader();

        let request = VoteRequest {
            term,
            candidate: Some(me),
            last: Some(state.store.last_known_log_entry_id().clone()),
        };
        let mut peers = Vec::new();
        for peer in state.cluster.others(state.store.current_config()) {
            match state.cluster.new_client(&peer) {
                Ok(client) => peers.push((peer, client)),
                Err(e) => warn!("[{}] No client for {}: {}", name, peer.id, e),
            }
        }
        (name, request, peers)
    };

    // Request votes from all peers without holding on to the state.
    let results = join_all(peers.into_iter().map(|(peer, mut client)| {
        let request = request.clone();
        async move { (peer, client.vote(request).await) }
    }))
    .await;

    let mut guard = arc_state.lock().await;
    let state = &mut *guard;
    debug!("[{}] Done waiting for vote requests", name);

    // The world has moved on or someone else has won in this term.
    if state.halted.is_some() || state.store.term() != term || state.role != Role::Candidate {
        return true;
    }

    let mut votes = 1; // Here we count our own vote for ourselves.
    for (peer, result) in results {
        match result {
            Ok(response) => {
                let response = response.into_inner();
                if response.term > term {
                    info!("[{}] Detected higher term {}", name, response.term);
                    become_follower(state, arc_state.clone(), response.term)
                        .await
                        .ok();
                    return true;
                }
                if response.granted {
                    votes += 1;
                }
            }
            Err(status) => debug!("[{}] Vote request to {} failed: {}", name, peer.id, status),
        }
    }

    let voters = state.store.current_config().voters.len();
    if 2 * votes > voters {
        info!(
            "[{}] Won election with {} votes, becoming leader for term {}",
            name, votes, term
        );
        if let Err(e) = become_leader(state, arc_state.clone(), term).await {
            warn!("[{}] Failed to become leader: {}", name, e);
        }
        true
    } else {
        info!("[{}] Lost election with {} votes", name, votes);
        false
    }
}

async fn become_leader(
    state: &mut RaftState,
    arc_state: Arc<Mutex<RaftState>>,
    term: i64,
) -> RaftResult<()> {
    let me = state.cluster.me();
    state.role = Role::Leader;
    state.timer_guard = None;
    state.cluster.record_leader(&me);

    // Entries from earlier terms only commit along with one from our own term.
    let result = state.store.append(term, Data::Noop(Noop {})).await;
    state.fatal(result)?;

    let next_index = state.store.next_index();
    state.followers = state
        .cluster
        .others(state.store.current_config())
        .into_iter()
        .map(|m| {
            (
                m.id,
                FollowerPosition {
                    // Optimistically assume the follower is as far as we are.
                    next_index,
                    match_index: -1,
                },
            )
        })
        .collect();
    state.report_leader(term, &me).await;

    update_committed(state, arc_state.clone(), term).await;
    spawn_replicate_loop(arc_state, term);
    Ok(())
}

// Starts the main leader replication loop. The loop stops once the term has
// moved on (or we otherwise detect we are no longer leader).
async fn replicate_loop(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    let period_ms = arc_state.lock().await.options.leader_replicate_ms;
    loop {
        {
            let state = arc_state.lock().await;
            if !state.is_leader_for(term) {
                info!("[{}] No longer leader for term {}", state.name(), term);
                return;
            }
            let me = state.cluster.me();
            state.report_leader(term, &me).await;
        }

        replicate_entries(arc_state.clone(), term).await;
        sleep(Duration::from_millis(add_jitter(period_ms))).await;
    }
}

// Makes a single request to all followers, heartbeating them and replicating
// any entries (or the snapshot) they don't have.
async fn replicate_entries(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    let (name, requests) = {
        let mut guard = arc_state.lock().await;
        let state = &mut *guard;
        if !state.is_leader_for(term) {
            return;
        }
        let name = state.name();

        // Membership may have changed since the last round.
        let others = state.cluster.others(state.store.current_config());
        state
            .followers
            .retain(|id, _| others.iter().any(|m| &m.id == id));

        let mut requests = Vec::new();
        for peer in others {
            let next_index = state.store.next_index();
            let position = state
                .followers
                .entry(peer.id.clone())
                .or_insert(FollowerPosition {
                    next_index,
                    match_index: -1,
                })
                .clone();
            let client = match state.cluster.new_client(&peer) {
                Ok(client) => client,
                Err(e) => {
                    warn!("[{}] No client for {}: {}", name, peer.id, e);
                    continue;
                }
            };
            let request = state.create_replication_request(&position, term);
            requests.push((peer, client, request));
        }
        (name, requests)
    };

    let results = join_all(
        requests
            .into_iter()
            .map(|(peer, client, request)| async move { (peer, replicate_to(client, request).await) }),
    )
    .await;

    let mut guard = arc_state.lock().await;
    let state = &mut *guard;
    if !state.is_leader_for(term) {
        return;
    }

    for (peer, result) in results {
        match result {
            Err(status) => debug!("[{}] Replication to {} failed: {}", name, peer.id, status),
            Ok(response) => {
                let rterm = response.term();
                if rterm > term {
                    info!(
                        "[{}] Detected higher term {} from peer {}",
                        name, rterm, peer.id
                    );
                    become_follower(state, arc_state.clone(), rterm).await.ok();
                    return;
                }
                state.handle_replication_response(&peer, &response);
            }
        }
    }
    update_committed(state, arc_state.clone(), term).await;
}

// Scans the state of our followers in the hope of finding a new index which
// has been replicated to a majority of voters. If such an index is found, the
// entries up to it are committed and applied.
async fn update_committed(state: &mut RaftState, arc_state: Arc<Mutex<RaftState>>, term: i64) {
    if !state.is_leader_for(term) {
        return;
    }

    let config = state.store.current_config().clone();
    let me = state.cluster.me();
    let self_votes = config.voters.iter().any(|m| m.id == me.id);

    let committed = state.store.committed_index();
    let mut new_committed = committed;
    for index in committed + 1..state.store.next_index() {
        // Only entries from our own term are committed by counting replicas.
        if state.store.entry_id_at_index(index).term != term {
            continue;
        }

        let mut matches = if self_votes { 1 } else { 0 };
        for voter in config.voters.iter().filter(|m| m.id != me.id) {
            if state
                .followers
                .get(&voter.id)
                .is_some_and(|f| f.match_index >= index)
            {
                matches += 1;
            }
        }
        if 2 * matches > config.voters.len() {
            new_committed = index;
        }
    }

    if new_committed > committed {
        let result = state.store.commit_to(new_committed).await;
        if state.fatal(result).is_err() {
            return;
        }
    }

    // A leader which is no longer part of the committed config steps down.
    if !self_votes && state.store.get_config_info().committed {
        info!("[{}] Removed from the cluster, stepping down", me.id);
        become_follower(state, arc_state, term).await.ok();
        return;
    }

    let result = state.store.try_compact().await;
    state.fatal(result).ok();
}

fn spawn_election_timer(
    arc_state: Arc<Mutex<RaftState>>,
    term: i64,
    timeout: Duration,
) -> TimerGuard {
    let handle = tokio::spawn(
        async move {
            sleep(timeout).await;
            debug!("Election timeout in term {}", term);
            spawn_election_loop(arc_state, term + 1);
        }
        .in_current_span(),
    );
    TimerGuard(handle)
}

fn spawn_election_loop(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    tokio::spawn(election_loop(arc_state, term).in_current_span());
}

fn spawn_replicate_loop(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    tokio::spawn(replicate_loop(arc_state, term).in_current_span());
}

// Runs a single replication round right away rather than waiting for the next
// heartbeat.
fn spawn_replication(arc_state: Arc<Mutex<RaftState>>, term: i64) {
    tokio::spawn(replicate_entries(arc_state, term).in_current_span());
}

#[tonic::async_trait]
impl Raft for RaftImpl {
    async fn vote(&self, request: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let request = request.into_inner();
        let candidate = request
            .candidate
            .ok_or_else(|| RaftError::missing("candidate"))?;
        let last = request.last.ok_or_else(|| RaftError::missing("last"))?;
        debug!(
            "[{}] Handling vote request from {} for term {}",
            self.address.id, candidate.id, request.term
        );

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_halted()?;

        // Reject anything from an outdated term.
        let term = state.store.term();
        if request.term < term {
            return Ok(Response::new(VoteResponse {
                term,
                granted: false,
            }));
        }

        // Candidates we don't know about, e.g., members removed from the
        // cluster, must not disrupt us by forcing a new term.
        if !state.is_voter(&candidate.id) {
            info!(
                "[{}] Denied vote to {}, not a voter",
                self.address.id, candidate.id
            );
            return Ok(Response::new(VoteResponse {
                term,
                granted: false,
            }));
        }

        // If we're in an outdated term, we revert to follower in the new later
        // term and may still grant the requesting candidate our vote.
        if request.term > term {
            become_follower(state, self.state.clone(), request.term).await?;
        }

        let term = state.store.term();
        let available = match state.store.voted_for() {
            None => true,
            Some(voted_for) => voted_for.id == candidate.id,
        };
        if !available {
            info!(
                "[{}] Denied vote to {}, already voted for another candidate",
                self.address.id, candidate.id
            );
            return Ok(Response::new(VoteResponse {
                term,
                granted: false,
            }));
        }
        if !state.store.log_entry_is_up_to_date(&last) {
            info!(
                "[{}] Denied vote to {}, log not up to date",
                self.address.id, candidate.id
            );
            return Ok(Response::new(VoteResponse {
                term,
                granted: false,
            }));
        }

        let result = state.store.update_voted_for(&Some(candidate.clone())).await;
        state.fatal(result)?;
        state.reset_election_timer(self.state.clone());
        info!("[{}] Granted vote to {}", self.address.id, candidate.id);
        Ok(Response::new(VoteResponse {
            term,
            granted: true,
        }))
    }

    async fn append(
        &self,
        request: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        let request = request.into_inner();
        let leader = request.leader.ok_or_else(|| RaftError::missing("leader"))?;
        let previous = request
            .previous
            .ok_or_else(|| RaftError::missing("previous"))?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_halted()?;

        // Handle the case where we are ahead of the leader. We inform the
        // leader of our (greater) term and fail the append.
        let term = state.store.term();
        if request.term < term {
            return Ok(Response::new(AppendResponse {
                term,
                success: false,
                next_index: state.store.next_index(),
            }));
        }

        // The sender is the leader for its term. If its term is greater than
        // ours, or we were campaigning, we fall back to a clean follower state.
        if request.term > term || state.role != Role::Follower {
            become_follower(state, self.state.clone(), request.term).await?;
        } else {
            state.reset_election_timer(self.state.clone());
        }

        // Record the latest leader.
        let term = state.store.term();
        state.cluster.record_leader(&leader);
        state.report_leader(term, &leader).await;

        let result = state
            .store
            .append_entries(&previous, &request.entries)
            .await;
        let outcome = state.fatal(result)?;
        let last = match outcome {
            AppendOutcome::Mismatch { next_index } => {
                return Ok(Response::new(AppendResponse {
                    term,
                    success: false,
                    next_index,
                }));
            }
            AppendOutcome::Appended { last } => last,
        };

        // If the leader considers an entry committed, it is guaranteed that
        // all members of the cluster agree on the log up to that index, so it
        // is safe to apply the entries to the state machine.
        let result = state.store.commit_to(request.committed.min(last)).await;
        state.fatal(result)?;
        let result = state.store.try_compact().await;
        state.fatal(result)?;

        Ok(Response::new(AppendResponse {
            term,
            success: true,
            next_index: last + 1,
        }))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let request = request.into_inner();
        let leader = request.leader.ok_or_else(|| RaftError::missing("leader"))?;
        let last = request.last.ok_or_else(|| RaftError::missing("last"))?;
        let config = request.config.unwrap_or_default();

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_halted()?;

        let term = state.store.term();
        if request.term < term {
            return Ok(Response::new(InstallSnapshotResponse { term }));
        }
        if request.term > term || state.role != Role::Follower {
            become_follower(state, self.state.clone(), request.term).await?;
        } else {
            state.reset_election_timer(self.state.clone());
        }
        let term = state.store.term();
        state.cluster.record_leader(&leader);

        let size_bytes = request.snapshot.len();
        let before = state.store.get_latest_snapshot().last;
        let result = state
            .store
            .install_snapshot(Bytes::from(request.snapshot), last.clone(), config)
            .await;
        match result {
            Ok(()) => (),
            // A stale snapshot, we are already further along.
            Err(RaftError::InvalidArgument(message)) => {
                debug!("[{}] {}", self.address.id, message);
            }
            Err(e) => {
                state.halt(&e.to_string());
                return Err(e.into());
            }
        }

        if state.store.get_latest_snapshot().last != before {
            info!(
                "[{}] Installed snapshot from {} up to index {}",
                self.address.id, leader.id, last.index
            );
            if let Some(d) = &state.diagnostics {
                d.lock().await.report_snapshot(last.index, size_bytes);
            }
        }
        Ok(Response::new(InstallSnapshotResponse { term }))
    }
}

#[async_trait]
impl Client for RaftImpl {
    async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    async fn commit(&self, payload: Bytes, timeout: Duration) -> RaftResult<EntryId> {
        self.submit(|_| Ok(Data::Payload(payload.to_vec())), timeout)
            .await
    }

    async fn status(&self) -> ClusterStatus {
        let state = self.state.lock().await;
        let leader = match state.role {
            Role::Leader => Some(state.cluster.me()),
            _ => state.cluster.leader(),
        };
        ClusterStatus {
            role: state.role,
            term: state.store.term(),
            leader,
            members: state.store.current_config().voters.clone(),
            committed: state.store.committed_index(),
            applied: state.store.applied_index(),
        }
    }

    async fn add_member(&self, member: Member, timeout: Duration) -> RaftResult<()> {
        info!("[{}] Adding member {:?}", self.address.id, member);
        self.submit(
            move |info| {
                if !info.committed {
                    return Err(RaftError::ConfigChangeInProgress { index: info.index });
                }
                if info
                    .config
                    .voters
                    .iter()
                    .any(|m| m.id == member.id || m.address == member.address)
                {
                    return Err(RaftError::MemberExists {
                        id: member.id.clone(),
                        address: member.address.clone(),
                    });
                }
                let mut config = info.config.clone();
                config.voters.push(member);
                Ok(Data::Config(config))
            },
            timeout,
        )
        .await
        .map(|_| ())
    }

    async fn remove_member(&self, id: &str, timeout: Duration) -> RaftResult<()> {
        info!("[{}] Removing member {}", self.address.id, id);
        self.submit(
            |info| {
                if !info.committed {
                    return Err(RaftError::ConfigChangeInProgress { index: info.index });
                }
                if !info.config.voters.iter().any(|m| m.id == id) {
                    return Err(RaftError::MemberNotFound(id.to_string()));
                }
                let mut config = info.config.clone();
                config.voters.retain(|m| m.id != id);
                if config.voters.is_empty() {
                    return Err(RaftError::InvalidArgument(
                        "Cannot remove the last member".to_string(),
                    ));
                }
                Ok(Data::Config(config))
            },
            timeout,
        )
        .await
        .map(|_| ())
    }

    async fn halted(&self) -> Option<String> {
        self.state.lock().await.halted.clone()
    }
}

// Returns a value no lower than the supplied bound, with some additive jitter.
fn add_jitter(lower: u64) -> u64 {
    let upper = (lower as f64 * 1.3) as u64;
    if upper <= lower {
        return lower;
    }
    rand::thread_rng().gen_range(lower..upper)
}
