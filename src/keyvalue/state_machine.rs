use async_std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::keyvalue::command::{Command, decode_stream, encode_stream};
use crate::keyvalue::store::{Contents, MapStore, Store};
use crate::raft::{Snapshot, StateMachine, StateMachineError, StateMachineResult};

// Applies committed commands to the store shared with the read path.
pub struct KeyValueStateMachine {
    store: Arc<MapStore>,
}

impl KeyValueStateMachine {
    pub fn new(store: Arc<MapStore>) -> Self {
        KeyValueStateMachine { store }
    }
}

#[async_trait]
impl StateMachine for KeyValueStateMachine {
    async fn apply(&mut self, payload: &Bytes) -> StateMachineResult {
        let command =
            Command::decode(payload).map_err(|e| StateMachineError::Malformed(Box::new(e)))?;
        match command {
            Command::Set { key, value } => self.store.set(key, value).await,
            Command::Delete { key } => self.store.delete(&key).await,
        }
        Ok(())
    }

    async fn create_snapshot(&self) -> Box<dyn Snapshot + Send + Sync> {
        Box::new(KeyValueSnapshot {
            contents: self.store.contents().await,
        })
    }

    async fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult {
        // Build the new contents on the side so that a bad snapshot leaves
        // the store as it was.
        let mut contents = Contents::new();
        let commands =
            decode_stream(snapshot).map_err(|e| StateMachineError::Malformed(Box::new(e)))?;
        for command in commands {
            match command {
                Command::Set { key, value } => {
                    contents.insert(key, value);
                }
                Command::Delete { key } => {
                    contents.remove(&key);
                }
            }
        }

        info!("Restoring {} keys from snapshot", contents.len());
        self.store.replace(contents).await;
        Ok(())
    }
}

// Holds a point-in-time copy of the store contents.
pub struct KeyValueSnapshot {
    contents: Contents,
}

impl Snapshot for KeyValueSnapshot {
    // Keys are written in sorted order so identical contents always produce
    // identical bytes.
    fn persist(&self) -> Result<Bytes, StateMachineError> {
        let mut commands: Vec<Command> = self
            .contents
            .iter()
            .map(|(key, value)| Command::set(key.clone(), value.clone()))
            .collect();
        commands.sort_by(|a, b| a.key().cmp(b.key()));
        debug!("Persisting snapshot with {} keys", commands.len());
        Ok(encode_stream(&commands))
    }
}
