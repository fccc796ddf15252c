use async_std::sync::{Arc, Mutex};
use bytes::Bytes;
use futures::channel::oneshot::{Receiver, Sender, channel};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::log::LogSlice;
use crate::raft::persistence;
use crate::raft::persistence::{Persistence, PersistenceOptions};
use crate::raft::raft_common_proto::entry::Data;
use crate::raft::raft_common_proto::entry::Data::{Config, Payload};
use crate::raft::raft_common_proto::{ClusterConfig, Entry, EntryId, Member};
use crate::raft::state_machine::StateMachine;

// Handles persistent storage for a Raft member, including a snapshot starting
// from the beginning of time up to some index, and running log of entries since
// the index included in the last snapshot.
//
// Also takes care of periodic compaction, updating listeners when the committed
// portion reaches as certain index, etc.
pub struct Store {
    // Dependencies and constants.
    compaction_threshold_bytes: i64,
    name: String,
    state_machine: Arc<Mutex<dyn StateMachine + Send + Sync>>,
    persistence: Box<dyn Persistence + Send + Sync>,

    // Persistent raft state as defined in the paper.
    log: LogSlice,
    snapshot: LogSnapshot,
    term: i64,
    voted_for: Option<Member>,

    // Non-persistent. Recomputed from the above on restart.
    committed: i64,
    applied: i64,
    config_info: ConfigInfo,

    listener_uid: i64,
    listeners: BTreeSet<CommitListener>,
}

// Holds information about the cluster configuration currently in effect.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigInfo {
    // The latest known config, either from the log or from the snapshot.
    pub config: ClusterConfig,

    // The index of the entry which introduced the config.
    pub index: i64,

    // Whether the entry introducing the config has been committed.
    pub committed: bool,
}

// The result of trying to add entries received from a leader.
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    // The entries are now part of the log. Holds the index of the last entry
    // covered by the request.
    Appended { last: i64 },

    // The entry preceding the supplied ones doesn't match our log. Holds the
    // index the leader should try next.
    Mismatch { next_index: i64 },
}

impl Store {
    pub async fn new(
        persistence_options: PersistenceOptions,
        state_machine: Arc<Mutex<dyn StateMachine + Send + Sync>>,
        compaction_threshold_bytes: i64,
        name: &str,
        initial_config: ClusterConfig,
    ) -> RaftResult<Self> {
        let persistence = persistence::new(persistence_options).await?;

        let initial_bytes = state_machine.lock().await.create_snapshot().await.persist()?;
        let initial_snapshot = persistence::initial_snapshot(initial_config, initial_bytes);
        let last = initial_snapshot.last.clone();

        let mut result = Self {
            name: name.to_string(),
            compaction_threshold_bytes,
            state_machine,
            persistence,

            log: LogSlice::new_empty(last.clone()),
            snapshot: initial_snapshot,
            term: 0,
            voted_for: None,

            committed: last.index,
            applied: last.index,
            config_info: ConfigInfo {
                config: ClusterConfig::default(),
                index: last.index,
                committed: true,
            },

            listener_uid: 0,
            listeners: BTreeSet::new(),
        };

        // Restoring has to happen before anything else touches the store so
        // that we never clobber the persisted state.
        result.restore_persisted().await?;

        // Make sure all the files exist from here on, so that a partial write
        // later on can never leave behind a state we cannot read.
        result.persist_all().await?;
        result.update_config_info();

        Ok(result)
    }

    // Reads state from the persistence instance and installs it in this store.
    async fn restore_persisted(&mut self) -> RaftResult<()> {
        let mut loaded = match self.persistence.read().await? {
            Some(loaded) => loaded,
            None => return Ok(()),
        };
        loaded.validate()?;
        loaded.trim_entries();

        self.state_machine
            .lock()
            .await
            .load_snapshot(&loaded.snapshot.snapshot)
            .await?;

        let last = loaded.snapshot.last.clone();
        self.log = LogSlice::new(last.clone(), loaded.entries)?;
        self.snapshot = loaded.snapshot;
        self.term = loaded.term;
        self.voted_for = loaded.voted_for;
        self.committed = last.index;
        self.applied = last.index;

        info!(
            "[{}] Restored persisted state: term {}, snapshot up to index {}, {} log entries",
            self.name,
            self.term,
            last.index,
            self.log.entries().len()
        );
        Ok(())
    }

    // Writes all the current persistent state.
    async fn persist_all(&self) -> RaftResult<()> {
        self.persistence
            .write(self.term, &self.voted_for, self.log.entries(), &self.snapshot)
            .await?;
        Ok(())
    }

    async fn persist_entries(&self) -> RaftResult<()> {
        self.persistence.write_entries(self.log.entries()).await?;
        Ok(())
    }

    // Returns the index up to (and including) which the corresponding entries are
    // considered committed.
    pub fn committed_index(&self) -> i64 {
        self.committed
    }

    pub fn applied_index(&self) -> i64 {
        self.applied
    }

    // Returns a copy of the latest snapshot backing this store.
    pub fn get_latest_snapshot(&self) -> LogSnapshot {
        self.snapshot.clone()
    }

    // Returns the index of the first entry not (yet) present in the store.
    pub fn next_index(&self) -> i64 {
        self.log.next_index()
    }

    // Adds an entry with the supplied data to the log (without committing it)
    // and persists the log. Returns the id for the created entry.
    pub async fn append(&mut self, term: i64, data: Data) -> RaftResult<EntryId> {
        let is_config = matches!(&data, Config(_));

        let entry_id = self.log.append(term, data);
        if is_config {
            self.update_config_info();
        }
        self.persist_entries().await?;
        Ok(entry_id)
    }

    // Adds entries received from the leader, which claims they immediately
    // follow "previous". Conflicting entries of ours are replaced.
    pub async fn append_entries(
        &mut self,
        previous: &EntryId,
        entries: &[Entry],
    ) -> RaftResult<AppendOutcome> {
        let last = previous.index + entries.len() as i64;

        // Anything up to the start of our slice is covered by our snapshot,
        // which only ever contains committed entries.
        let start = self.log.previous_id().clone();
        let (previous, entries) = if previous.index < start.index {
            let skip = ((start.index - previous.index) as usize).min(entries.len());
            (start, &entries[skip..])
        } else {
            (previous.clone(), entries)
        };

        if previous != *self.log.previous_id() && !self.log.contains(&previous) {
            let next_index = previous.index.min(self.log.next_index());
            debug!(
                "[{}] Rejecting entries after {:?}, asking for index {}",
                self.name, previous, next_index
            );
            return Ok(AppendOutcome::Mismatch { next_index });
        }

        if self.log.append_all(entries)? {
            self.update_config_info();
            self.persist_entries().await?;
        }
        Ok(AppendOutcome::Appended { last })
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<Member> {
        self.voted_for.clone()
    }

    // Updates just the "voted_for" part of the persistent state.
    pub async fn update_voted_for(&mut self, voted_for: &Option<Member>) -> RaftResult<()> {
        let term = self.term;
        self.update_term_info(term, voted_for).await
    }

    // Updates the term information in persistent state.
    pub async fn update_term_info(
        &mut self,
        term: i64,
        voted_for: &Option<Member>,
    ) -> RaftResult<()> {
        self.term = term;
        self.voted_for = voted_for.clone();
        self.persistence
            .write_state(self.term, &self.voted_for)
            .await?;
        Ok(())
    }

    // Returns information about the config currently in effect.
    pub fn get_config_info(&self) -> ConfigInfo {
        self.config_info.clone()
    }

    pub fn current_config(&self) -> &ClusterConfig {
        &self.config_info.config
    }

    // Compacts log entries into a new snapshot if the log has grown too large.
    pub async fn try_compact(&mut self) -> RaftResult<()> {
        if self.log.size_bytes() <= self.compaction_threshold_bytes {
            return Ok(());
        }
        if self.applied <= self.log.previous_id().index {
            return Ok(());
        }

        let applied_id = self.log.id_at(self.applied);
        let config = match self.log.latest_config_entry_until(self.applied) {
            Some(Entry {
                data: Some(Config(config)),
                ..
            }) => config,
            _ => self.snapshot.config.clone(),
        };

        // Only capturing the state needs the state machine. Serializing can
        // happen without holding on to it.
        let handle = self.state_machine.lock().await.create_snapshot().await;
        let snapshot = LogSnapshot {
            last: applied_id.clone(),
            config,
            snapshot: handle.persist()?,
        };

        self.persistence.write_snapshot(&snapshot).await?;
        let size_bytes = snapshot.snapshot.len();
        self.snapshot = snapshot;

        // Entries after the applied index stay, dropping them would fail
        // commit operations in flight on the leader.
        self.log.prune_until(&applied_id);
        self.persist_entries().await?;
        self.update_config_info();

        info!(
            "[{}] Compacted log with snapshot up to (including) index {}, {} bytes",
            self.name, applied_id.index, size_bytes
        );
        Ok(())
    }

    // Marks the stored entries up to (and including) the supplied index as
    // committed, applies them to the state machine and informs listeners.
    pub async fn commit_to(&mut self, new_commit_index: i64) -> RaftResult<()> {
        if new_commit_index <= self.committed {
            return Ok(());
        }

        let last = self.log.last_known_id().index;
        if new_commit_index > last {
            return Err(RaftError::Internal(format!(
                "Cannot commit to index {} beyond the end of the log {}",
                new_commit_index, last
            )));
        }

        debug!(
            "[{}] Updated committed index from {} to {}",
            &self.name, self.committed, new_commit_index
        );
        self.committed = new_commit_index;
        self.config_info.committed = self.committed >= self.config_info.index;

        self.apply_committed().await?;
        self.resolve_listeners();
        Ok(())
    }

    // Returns the entry id for the entry at the supplied index. Must only be
    // called if the index is known to be present in memory, or is the last
    // entry included in the snapshot.
    pub fn entry_id_at_index(&self, index: i64) -> EntryId {
        self.log.id_at(index)
    }

    // Returns the highest index known to exist (even if the entry is not held
    // in this instance).
    pub fn last_known_log_entry_id(&self) -> &EntryId {
        self.log.last_known_id()
    }

    // Returns true if the supplied last entry id is at least as up-to-date
    // as the slice of the log tracked by this instance.
    pub fn log_entry_is_up_to_date(&self, other_last: &EntryId) -> bool {
        self.log.is_up_to_date(other_last)
    }

    // Returns up to "limit" entries strictly after the supplied index.
    pub fn get_entries_after(&self, index: i64, limit: usize, max_bytes: i64) -> Vec<Entry> {
        self.log.get_entries_after(index, limit, max_bytes)
    }

    // Registers a listener which resolves once the supplied entry has been
    // applied, or once it becomes clear that a different entry won.
    pub fn add_listener(&mut self, expected: EntryId) -> Receiver<RaftResult<EntryId>> {
        let (sender, receiver) = channel::<RaftResult<EntryId>>();
        self.listeners.insert(CommitListener {
            index: expected.index,
            expected,
            sender,
            uid: self.listener_uid,
        });
        self.listener_uid += 1;

        // Listeners for entries which are already applied resolve right away.
        self.resolve_listeners();

        receiver
    }

    // Fails all pending listeners.
    pub fn cancel_listeners(&mut self, reason: &str) {
        while let Some(listener) = self.listeners.pop_first() {
            listener
                .sender
                .send(Err(RaftError::Halted(reason.to_string())))
                .ok();
        }
    }

    // Replaces the state up to "last" with the supplied snapshot.
    pub async fn install_snapshot(
        &mut self,
        snapshot: Bytes,
        last: EntryId,
        config: ClusterConfig,
    ) -> RaftResult<()> {
        if last.index < self.applied {
            return Err(RaftError::InvalidArgument(format!(
                "[{}] Refused to install snapshot that would go back in time. Last index in snapshot is {}, our latest applied index is {}",
                &self.name, &last.index, &self.applied
            )));
        }

        // We already hold the entries, catching up on them is enough.
        if self.log.contains(&last) {
            return self.commit_to(last.index).await;
        }

        // The state machine goes first, if it refuses the snapshot nothing
        // else has changed.
        self.state_machine
            .lock()
            .await
            .load_snapshot(&snapshot)
            .await?;

        let log_snapshot = LogSnapshot {
            last: last.clone(),
            config,
            snapshot,
        };
        self.persistence.write_snapshot(&log_snapshot).await?;
        self.snapshot = log_snapshot;

        // The snapshot's last entry is not in our log, so none of our entries
        // can be trusted.
        self.log.prune_until(&last);
        self.persist_entries().await?;

        self.applied = last.index;
        self.committed = last.index;
        self.update_config_info();
        self.resolve_listeners();

        info!(
            "[{}] Installed snapshot up to (including) index {}",
            self.name, last.index
        );
        Ok(())
    }

    // Applies any committed entries which haven't been applied to the state
    // machine yet. Stops at the first failure.
    async fn apply_committed(&mut self) -> RaftResult<()> {
        while self.applied < self.committed {
            let index = self.applied + 1;
            let entry = self.log.entry_at(index).clone();

            if let Some(Payload(bytes)) = entry.data {
                let result = self
                    .state_machine
                    .lock()
                    .await
                    .apply(&Bytes::from(bytes))
                    .await;
                if let Err(e) = result {
                    warn!("[{}] Failed to apply entry {}: {}", self.name, index, e);
                    return Err(e.into());
                }
            }

            self.applied = index;
            debug!("[{}] Applied entry {}", self.name, index);
        }
        Ok(())
    }

    // Resolves all listeners waiting on entries which have been applied.
    fn resolve_listeners(&mut self) {
        while let Some(first) = self.listeners.first() {
            if first.index > self.applied {
                break;
            }
            let Some(next) = self.listeners.pop_first() else {
                break;
            };

            // Dropping the sender tells the receiver the outcome is unknown.
            if next.index < self.log.previous_id().index {
                continue;
            }

            let actual = self.log.id_at(next.index);
            let result = if actual == next.expected {
                Ok(actual)
            } else {
                Err(RaftError::Superseded { index: next.index })
            };
            if next.sender.send(result).is_err() {
                debug!("[{}] Listener for {} no longer listening", self.name, next.index);
            }
        }
    }

    // Recomputes which config is in effect.
    fn update_config_info(&mut self) {
        self.config_info = match self.log.latest_config_entry() {
            Some(Entry {
                id: Some(id),
                data: Some(Config(config)),
            }) => ConfigInfo {
                config,
                index: id.index,
                committed: self.committed >= id.index,
            },
            _ => ConfigInfo {
                config: self.snapshot.config.clone(),
                index: self.snapshot.last.index,
                committed: true,
            },
        };
    }
}

// Represents a snapshot of the state machine after applying a complete prefix
// of entries since the beginning of time.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    // The id of the latest entry included in the snapshot.
    pub last: EntryId,

    // The cluster config in effect as of the latest entry.
    pub config: ClusterConfig,

    // The snapshot bytes as produced by the state machine.
    pub snapshot: Bytes,
}

// Each instance represents an ongoing commit operation waiting for the
// applied index to reach the index of their tentative new entry.
#[derive(Debug)]
struct CommitListener {
    // The index the listener would like to be notified about.
    index: i64,

    // The entry the listener hopes to find at the index.
    expected: EntryId,

    sender: Sender<RaftResult<EntryId>>,

    // Used to disambiguate between listeners for the same index.
    uid: i64,
}

impl Eq for CommitListener {}

impl PartialEq<Self> for CommitListener {
    fn eq(&self, other: &Self) -> bool {
        (self.index, self.uid).eq(&(other.index, other.uid))
    }
}

impl PartialOrd<Self> for CommitListener {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitListener {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, self.uid).cmp(&(other.index, other.uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::persistence::FilePersistenceOptions;
    use crate::raft::raft_common_proto::entry::Data::Noop;
    use crate::raft::testing::FakeStateMachine;
    use futures::FutureExt;
    use tempfile::TempDir;

    const COMPACTION_THRESHOLD_BYTES: i64 = 5000;

    #[tokio::test]
    async fn test_initial() {
        let fixture = Fixture::new();
        let store = fixture.make_store().await;
        assert_eq!(store.committed_index(), -1);
        assert_eq!(store.applied_index(), -1);
        assert_eq!(store.next_index(), 0);
        assert_eq!(store.current_config(), &fixture.config);
        assert!(store.get_config_info().committed);
    }

    #[tokio::test]
    async fn test_commit_to_bad_index() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store.append(2, Payload(Vec::new())).await.unwrap();

        // Attempt to "commit to" a value which hasn't yet been appended.
        assert!(store.commit_to(17).await.is_err());
        assert_eq!(store.committed_index(), -1);
    }

    #[tokio::test]
    async fn test_commit_to_applies() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store.append(2, Payload(b"a".to_vec())).await.unwrap();
        store.append(2, Noop(Default::default())).await.unwrap();
        let eid = store.append(2, Payload(b"b".to_vec())).await.unwrap();

        store.commit_to(eid.index).await.unwrap();
        assert_eq!(store.applied_index(), 2);

        // Noop.
        store.commit_to(eid.index - 1).await.unwrap();

        let applied = fixture.state_machine.lock().await.applied.clone();
        assert_eq!(applied, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[tokio::test]
    async fn test_apply_failure_stops_applying() {
        let fixture = Fixture::new();
        fixture.state_machine.lock().await.poison = Some(Bytes::from("bad"));
        let mut store = fixture.make_store().await;
        store.append(2, Payload(b"good".to_vec())).await.unwrap();
        store.append(2, Payload(b"bad".to_vec())).await.unwrap();
        store.append(2, Payload(b"later".to_vec())).await.unwrap();

        let result = store.commit_to(2).await;
        assert!(matches!(result, Err(RaftError::StateMachine(_))));
        assert_eq!(store.applied_index(), 0);
    }

    #[tokio::test]
    async fn test_listener() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;

        store.append(67, Payload(Vec::new())).await.unwrap();
        store.append(67, Payload(Vec::new())).await.unwrap();
        let eid = store.append(68, Payload(Vec::new())).await.unwrap();
        let receiver = store.add_listener(eid.clone());

        store.commit_to(2).await.unwrap();
        let output = receiver.now_or_never();
        assert!(output.is_some());

        let result = output.unwrap().unwrap().unwrap();
        assert_eq!(2, result.index);
        assert_eq!(68, result.term);
    }

    #[tokio::test]
    async fn test_listener_multi() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        let receiver1 = store.add_listener(EntryId { term: 67, index: 0 });
        let receiver2 = store.add_listener(EntryId { term: 67, index: 1 });
        let receiver3 = store.add_listener(EntryId { term: 67, index: 0 });

        store.append(67, Payload(Vec::new())).await.unwrap();
        store.commit_to(0).await.unwrap();

        assert!(receiver1.now_or_never().is_some());
        assert!(receiver2.now_or_never().is_none());
        assert!(receiver3.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_listener_past() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;

        store.append(67, Payload(Vec::new())).await.unwrap();
        store.append(67, Payload(Vec::new())).await.unwrap();
        store.commit_to(1).await.unwrap();

        let receiver = store.add_listener(EntryId { term: 67, index: 0 });
        assert!(receiver.now_or_never().unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_listener_superseded() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;

        // Our own entry at index 0, later replaced by a new leader's entry.
        let ours = store.append(3, Payload(b"ours".to_vec())).await.unwrap();
        let receiver = store.add_listener(ours);

        let outcome = store
            .append_entries(
                &EntryId {
                    term: -1,
                    index: -1,
                },
                &[payload_entry(4, 0)],
            )
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { last: 0 });
        store.commit_to(0).await.unwrap();

        let result = receiver.now_or_never().unwrap().unwrap();
        assert!(matches!(result, Err(RaftError::Superseded { index: 0 })));
    }

    #[tokio::test]
    async fn test_cancel_listeners() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        let eid = store.append(1, Payload(Vec::new())).await.unwrap();
        let receiver = store.add_listener(eid);

        store.cancel_listeners("shutting down");
        let result = receiver.now_or_never().unwrap().unwrap();
        assert!(matches!(result, Err(RaftError::Halted(_))));
    }

    #[tokio::test]
    async fn test_append_entries_mismatch() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store
            .append_entries(
                &EntryId {
                    term: -1,
                    index: -1,
                },
                &[payload_entry(1, 0), payload_entry(1, 1)],
            )
            .await
            .unwrap();

        // Previous entry far in the future.
        let outcome = store
            .append_entries(&EntryId { term: 1, index: 7 }, &[payload_entry(1, 8)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Mismatch { next_index: 2 });

        // Previous entry present, but with a different term.
        let outcome = store
            .append_entries(&EntryId { term: 2, index: 1 }, &[payload_entry(2, 2)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Mismatch { next_index: 1 });

        assert_eq!(store.next_index(), 2);
    }

    #[tokio::test]
    async fn test_append_entries_before_snapshot() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store
            .install_snapshot(
                Bytes::from("0"),
                EntryId { term: 2, index: 4 },
                fixture.config.clone(),
            )
            .await
            .unwrap();

        // The leader is behind on what it thinks we have.
        let outcome = store
            .append_entries(
                &EntryId { term: 2, index: 2 },
                &[
                    payload_entry(2, 3),
                    payload_entry(2, 4),
                    payload_entry(2, 5),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { last: 5 });
        assert_eq!(store.next_index(), 6);
    }

    #[tokio::test]
    async fn test_compaction() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        let config = ClusterConfig {
            voters: vec![member("x")],
        };
        store.append(67, Config(config.clone())).await.unwrap();
        let eid = store
            .append(
                67,
                Payload(vec![0; 2 * COMPACTION_THRESHOLD_BYTES as usize]),
            )
            .await
            .unwrap();
        assert!(store.log.size_bytes() > COMPACTION_THRESHOLD_BYTES);

        store.commit_to(eid.index).await.unwrap();
        store.try_compact().await.unwrap();

        assert!(store.log.size_bytes() < COMPACTION_THRESHOLD_BYTES);
        let snapshot = store.get_latest_snapshot();
        assert_eq!(snapshot.last, eid);
        assert_eq!(snapshot.config, config);
        assert_eq!(snapshot.snapshot, Bytes::from("1"));
        assert_eq!(store.current_config(), &config);
    }

    #[tokio::test]
    async fn test_compaction_keeps_unapplied_entries() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        let big = vec![0; 2 * COMPACTION_THRESHOLD_BYTES as usize];
        let first = store.append(67, Payload(big.clone())).await.unwrap();
        store.append(67, Payload(big)).await.unwrap();

        store.commit_to(first.index).await.unwrap();
        store.try_compact().await.unwrap();

        assert_eq!(store.get_latest_snapshot().last, first);
        assert_eq!(store.log.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        assert_eq!(store.get_latest_snapshot().last.term, -1);
        assert_eq!(store.get_latest_snapshot().last.index, -1);

        let config = ClusterConfig {
            voters: vec![member("a"), member("b")],
        };
        store
            .install_snapshot(Bytes::from(""), EntryId { term: 17, index: 22 }, config.clone())
            .await
            .unwrap();
        assert_eq!(22, store.committed_index());
        assert_eq!(store.current_config(), &config);
        assert_eq!(fixture.state_machine.lock().await.snapshots_loaded, 1);

        let snap = store.get_latest_snapshot();
        assert_eq!(17, snap.last.term);
        assert_eq!(22, snap.last.index);

        // Going back in time is refused.
        let result = store
            .install_snapshot(Bytes::from(""), EntryId { term: 16, index: 12 }, config)
            .await;
        assert!(matches!(result, Err(RaftError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_install_snapshot_resolves_listeners() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;

        // Add a listener for a commit that will never go through here.
        let listener = store.add_listener(EntryId { term: 3, index: 14 });

        store
            .install_snapshot(
                Bytes::from(""),
                EntryId { term: 17, index: 22 },
                fixture.config.clone(),
            )
            .await
            .unwrap();
        assert_eq!(22, store.committed_index());

        // The entry was compacted away, so the outcome is unknown.
        let result = listener.await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_install_snapshot_with_present_entry() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store.append(5, Payload(b"a".to_vec())).await.unwrap();
        let eid = store.append(5, Payload(b"b".to_vec())).await.unwrap();

        store
            .install_snapshot(Bytes::from("ignored"), eid, fixture.config.clone())
            .await
            .unwrap();
        assert_eq!(store.committed_index(), 1);
        assert_eq!(fixture.state_machine.lock().await.snapshots_loaded, 0);
        assert_eq!(fixture.state_machine.lock().await.applied.len(), 2);
    }

    #[tokio::test]
    async fn test_config_info_append() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        assert_eq!(store.get_config_info().index, -1);

        store.append(17, Payload(Vec::new())).await.unwrap();
        assert_eq!(store.get_config_info().index, -1);

        let config = ClusterConfig {
            voters: vec![member("z")],
        };
        store.append(17, Config(config.clone())).await.unwrap();
        let info = store.get_config_info();
        assert_eq!(info.index, 1);
        assert_eq!(info.config, config);
        assert!(!info.committed);
    }

    #[tokio::test]
    async fn test_config_info_append_entries() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;

        store
            .append_entries(
                &EntryId {
                    term: -1,
                    index: -1,
                },
                &[
                    payload_entry(12, 0),
                    config_entry(12, 1, 7),
                    payload_entry(12, 2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.current_config().voters.len(), 7);

        store
            .append_entries(
                &EntryId { term: 12, index: 2 },
                &[config_entry(12, 3, 3), config_entry(12, 4, 5)],
            )
            .await
            .unwrap();
        assert_eq!(store.current_config().voters.len(), 5);
        assert!(!store.get_config_info().committed);

        store.commit_to(4).await.unwrap();
        assert!(store.get_config_info().committed);

        // Entries from a later term leave the committed config alone.
        store
            .append_entries(&EntryId { term: 12, index: 4 }, &[payload_entry(13, 5)])
            .await
            .unwrap();
        assert_eq!(store.current_config().voters.len(), 5);
    }

    #[tokio::test]
    async fn test_config_info_truncated() {
        let fixture = Fixture::new();
        let mut store = fixture.make_store().await;
        store
            .append_entries(
                &EntryId {
                    term: -1,
                    index: -1,
                },
                &[payload_entry(1, 0), config_entry(1, 1, 7)],
            )
            .await
            .unwrap();
        assert_eq!(store.current_config().voters.len(), 7);

        // The uncommitted config entry gets replaced.
        store
            .append_entries(&EntryId { term: 1, index: 0 }, &[payload_entry(2, 1)])
            .await
            .unwrap();
        assert_eq!(store.current_config(), &fixture.config);
    }

    #[tokio::test]
    async fn test_restore_persisted_snapshot() {
        let fixture = Fixture::new();

        let snapshot_bytes = Bytes::from("some snapshot");
        let entry_id = EntryId { term: 15, index: 19 };
        let config = ClusterConfig {
            voters: vec![member("q")],
        };

        {
            let mut store = fixture.make_store().await;
            store
                .install_snapshot(snapshot_bytes.clone(), entry_id.clone(), config.clone())
                .await
                .unwrap();
        }

        // Another store backed by the same directory picks up the contents.
        {
            let store = fixture.make_store().await;
            assert_eq!(&store.snapshot.last, &entry_id);
            assert_eq!(&store.snapshot.snapshot, &snapshot_bytes);
            assert_eq!(store.current_config(), &config);
            assert_eq!(store.committed_index(), 19);
        }
    }

    #[tokio::test]
    async fn test_restore_persisted_voted_for() {
        let fixture = Fixture::new();
        let voted_for = Some(member("some host"));

        {
            let mut store = fixture.make_store().await;
            store.update_voted_for(&voted_for).await.unwrap();
        }

        {
            let store = fixture.make_store().await;
            assert_eq!(store.voted_for(), voted_for);
        }
    }

    #[tokio::test]
    async fn test_restore_persisted_term() {
        let fixture = Fixture::new();
        let term = 728;

        {
            let mut store = fixture.make_store().await;
            store.update_term_info(term, &None).await.unwrap();
        }

        {
            let store = fixture.make_store().await;
            assert_eq!(store.term(), term);
        }
    }

    #[tokio::test]
    async fn test_restore_persisted_entries() {
        let fixture = Fixture::new();

        {
            let mut store = fixture.make_store().await;
            store
                .append_entries(
                    &EntryId {
                        term: -1,
                        index: -1,
                    },
                    &[
                        payload_entry(12, 0),
                        payload_entry(12, 1),
                        payload_entry(12, 2),
                    ],
                )
                .await
                .unwrap();
            assert_eq!(2, store.last_known_log_entry_id().index);
        }

        {
            let store = fixture.make_store().await;
            assert_eq!(2, store.last_known_log_entry_id().index);

            // Entries are not known to be committed after a restart.
            assert_eq!(-1, store.committed_index());
        }
    }

    #[tokio::test]
    async fn test_restore_trims_entries_included_in_snapshot() {
        let fixture = Fixture::new();

        let entries = vec![
            payload_entry(4, 10),
            payload_entry(4, 11),
            payload_entry(4, 12),
            payload_entry(4, 13),
        ];
        let snapshot = LogSnapshot {
            last: EntryId { term: 4, index: 11 },
            config: fixture.config.clone(),
            snapshot: Bytes::from("some snap"),
        };

        {
            let store = fixture.make_store().await;
            store
                .persistence
                .write(7, &None, &entries, &snapshot)
                .await
                .expect("failed to write");
        }

        {
            let store = fixture.make_store().await;
            let entries = store.log.entries().clone();

            // Only the last two entries should remain.
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].id.as_ref().unwrap().index, 12);
            assert_eq!(entries[1].id.as_ref().unwrap().index, 13);
            assert_eq!(store.term(), 7);
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        config: ClusterConfig,
        state_machine: Arc<Mutex<FakeStateMachine>>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                temp_dir: TempDir::new().unwrap(),
                config: ClusterConfig {
                    voters: vec![member("a"), member("b"), member("c")],
                },
                state_machine: Arc::new(Mutex::new(FakeStateMachine::new())),
            }
        }

        async fn make_store(&self) -> Store {
            let options = PersistenceOptions::FilePersistence(FilePersistenceOptions {
                directory: self.temp_dir.path().to_str().unwrap().to_string(),
                wipe: false,
            });
            Store::new(
                options,
                self.state_machine.clone(),
                COMPACTION_THRESHOLD_BYTES,
                "testing-store",
                self.config.clone(),
            )
            .await
            .expect("store")
        }
    }

    fn payload_entry(term: i64, index: i64) -> Entry {
        Entry {
            id: Some(EntryId { term, index }),
            data: Some(Payload(Vec::new())),
        }
    }

    fn config_entry(term: i64, index: i64, num_voters: usize) -> Entry {
        let voters = (0..num_voters)
            .map(|p| member(&format!("member-{}", p)))
            .collect();
        Entry {
            id: Some(EntryId { term, index }),
            data: Some(Config(ClusterConfig { voters })),
        }
    }

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            address: format!("{}:1234", id),
        }
    }
}
