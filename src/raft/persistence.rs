use async_std::fs;
use async_std::io::WriteExt;
use async_std::path::{Path, PathBuf};
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::io::ErrorKind;
use thiserror::Error;
use tracing::{debug, info};

use crate::raft::raft_common_proto::{ClusterConfig, Entry, EntryId, Member};
use crate::raft::raft_persistence_proto::{Log, Snapshot, State};
use crate::raft::store::LogSnapshot;

const MAIN_STATE_PATH: &str = "state.pb.bin";
const SNAPSHOT_PATH: &str = "snapshot.pb.bin";
const LOG_PATH: &str = "log.pb.bin";
const TEMP_SUFFIX: &str = ".tmp";

// Stores the parts of a raft participant's state which need to survive a restart.
#[async_trait]
pub trait Persistence {
    // Returns the previously persisted state, if there is any.
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError>;

    // Replaces all of the persisted state.
    async fn write(
        &self,
        term: i64,
        voted_for: &Option<Member>,
        entries: &[Entry],
        snapshot: &LogSnapshot,
    ) -> Result<(), PersistenceError> {
        self.write_snapshot(snapshot).await?;
        self.write_entries(entries).await?;
        self.write_state(term, voted_for).await
    }

    async fn write_state(&self, term: i64, voted_for: &Option<Member>)
    -> Result<(), PersistenceError>;
    async fn write_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError>;
    async fn write_snapshot(&self, snapshot: &LogSnapshot) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub enum PersistenceOptions {
    FilePersistence(FilePersistenceOptions),
    NoPersistenceForTesting,
}

#[derive(Debug, Clone)]
pub struct FilePersistenceOptions {
    pub directory: String,

    // Whether to delete any existing state on startup.
    pub wipe: bool,
}

pub async fn new(
    options: PersistenceOptions,
) -> Result<Box<dyn Persistence + Send + Sync>, PersistenceError> {
    match options {
        PersistenceOptions::FilePersistence(options) => {
            Ok(Box::new(FilePersistence::new(&options).await?))
        }
        PersistenceOptions::NoPersistenceForTesting => Ok(Box::new(NoopPersistence {})),
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O failure for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Invalid persisted state: {0}")]
    Invalid(String),
}

// Everything read back from persistence on startup.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub term: i64,
    pub voted_for: Option<Member>,
    pub entries: Vec<Entry>,
    pub snapshot: LogSnapshot,
}

impl PersistedState {
    // Checks that the persisted entries form a contiguous run.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        let mut previous: Option<i64> = None;
        for entry in &self.entries {
            let index = match &entry.id {
                Some(id) => id.index,
                None => return Err(PersistenceError::Invalid("entry without id".to_string())),
            };
            if let Some(p) = previous {
                if index != p + 1 {
                    return Err(PersistenceError::Invalid(format!(
                        "non-contiguous entries {} and {}",
                        p, index
                    )));
                }
            }
            previous = Some(index);
        }

        if let (Some(first), Some(_)) = (self.entries.first(), previous) {
            let first_index = first.id.as_ref().map(|id| id.index).unwrap_or_default();
            if first_index > self.snapshot.last.index + 1 {
                return Err(PersistenceError::Invalid(format!(
                    "gap between snapshot (index {}) and first entry (index {})",
                    self.snapshot.last.index, first_index
                )));
            }
        }
        Ok(())
    }

    // Drops entries which are already covered by the snapshot.
    pub fn trim_entries(&mut self) {
        let last = self.snapshot.last.index;
        self.entries
            .retain(|e| e.id.as_ref().is_some_and(|id| id.index > last));
    }
}

struct NoopPersistence {}

#[async_trait]
impl Persistence for NoopPersistence {
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError> {
        Ok(None)
    }

    async fn write_state(&self, _: i64, _: &Option<Member>) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn write_entries(&self, _: &[Entry]) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn write_snapshot(&self, _: &LogSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

// Keeps one file per kind of state in a directory. Every write replaces the
// whole file by writing a temporary file and renaming it into place.
struct FilePersistence {
    directory: PathBuf,
}

impl FilePersistence {
    async fn new(options: &FilePersistenceOptions) -> Result<Self, PersistenceError> {
        let directory = PathBuf::from(options.directory.as_str());
        if options.wipe && fs::metadata(&directory).await.is_ok() {
            fs::remove_dir_all(&directory)
                .await
                .map_err(|e| io_error(&directory, e))?;
            info!("Wiped persisted state in {}", directory.display());
        }
        create_dir_if_not_exists(&directory).await?;
        info!("Created file persistence backed by directory {}", directory.display());
        Ok(FilePersistence { directory })
    }

    async fn write_to_file(&self, filename: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let path = self.directory.join(filename);
        let temp = self.directory.join(format!("{}{}", filename, TEMP_SUFFIX));
        // The data has to be on disk before the rename makes it visible, and
        // the rename itself is only durable once the directory is synced.
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| io_error(&temp, e))?;
        file.write_all(data).await.map_err(|e| io_error(&temp, e))?;
        file.sync_all().await.map_err(|e| io_error(&temp, e))?;
        drop(file);

        fs::rename(&temp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        fs::File::open(&self.directory)
            .await
            .map_err(|e| io_error(&self.directory, e))?
            .sync_all()
            .await
            .map_err(|e| io_error(&self.directory, e))?;
        debug!(path = %path.display(), bytes = data.len(), "persisted");
        Ok(())
    }

    // Returns None if the file does not exist.
    async fn read_file<M: Message + Default>(
        &self,
        filename: &str,
    ) -> Result<Option<M>, PersistenceError> {
        let path = self.directory.join(filename);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        M::decode(bytes.as_slice())
            .map(Some)
            .map_err(|source| PersistenceError::Decode {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let state: State = match self.read_file(MAIN_STATE_PATH).await? {
            Some(state) => state,
            None => return Ok(None),
        };

        // The main state file is written last, so the others must be present.
        let snapshot: Snapshot = self
            .read_file(SNAPSHOT_PATH)
            .await?
            .ok_or_else(|| PersistenceError::Invalid("missing snapshot file".to_string()))?;
        let log: Log = self
            .read_file(LOG_PATH)
            .await?
            .ok_or_else(|| PersistenceError::Invalid("missing log file".to_string()))?;

        let last = snapshot
            .last
            .ok_or_else(|| PersistenceError::Invalid("snapshot without last id".to_string()))?;

        Ok(Some(PersistedState {
            term: state.term,
            voted_for: state.voted_for,
            entries: log.entries,
            snapshot: LogSnapshot {
                last,
                config: snapshot.config.unwrap_or_default(),
                snapshot: Bytes::from(snapshot.data),
            },
        }))
    }

    async fn write_state(
        &self,
        term: i64,
        voted_for: &Option<Member>,
    ) -> Result<(), PersistenceError> {
        let output = State {
            term,
            voted_for: voted_for.clone(),
        };
        self.write_to_file(MAIN_STATE_PATH, &output.encode_to_vec())
            .await
    }

    async fn write_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError> {
        let output = Log {
            entries: entries.to_vec(),
        };
        self.write_to_file(LOG_PATH, &output.encode_to_vec()).await
    }

    async fn write_snapshot(&self, snapshot: &LogSnapshot) -> Result<(), PersistenceError> {
        let output = Snapshot {
            last: Some(snapshot.last.clone()),
            config: Some(snapshot.config.clone()),
            data: snapshot.snapshot.to_vec(),
        };
        self.write_to_file(SNAPSHOT_PATH, &output.encode_to_vec())
            .await
    }
}

async fn create_dir_if_not_exists(directory: &Path) -> Result<(), PersistenceError> {
    match fs::metadata(directory).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(PersistenceError::Invalid(format!(
            "Path exists but is not a directory: {}",
            directory.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir_all(directory)
            .await
            .map_err(|e| io_error(directory, e)),
        Err(e) => Err(io_error(directory, e)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

// Used by the store to seed the very first snapshot of a fresh participant.
pub fn initial_snapshot(config: ClusterConfig, state: Bytes) -> LogSnapshot {
    LogSnapshot {
        last: EntryId {
            term: -1,
            index: -1,
        },
        config,
        snapshot: state,
    }
}
