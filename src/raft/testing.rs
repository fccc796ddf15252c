use async_trait::async_trait;
use bytes::Bytes;

use crate::raft::state_machine::{Snapshot, StateMachine, StateMachineError, StateMachineResult};

// A fake implementation of the StateMachine trait for testing purposes. Keeps
// every applied payload so that tests can inspect them.
pub struct FakeStateMachine {
    pub applied: Vec<Bytes>,
    pub snapshots_loaded: i64,

    // Payloads and snapshots equal to this value are refused.
    pub poison: Option<Bytes>,
}

impl FakeStateMachine {
    pub fn new() -> Self {
        FakeStateMachine {
            applied: Vec::new(),
            snapshots_loaded: 0,
            poison: None,
        }
    }
}

struct FakeSnapshot {
    count: usize,
}

impl Snapshot for FakeSnapshot {
    fn persist(&self) -> Result<Bytes, StateMachineError> {
        Ok(Bytes::from(self.count.to_string()))
    }
}

#[async_trait]
impl StateMachine for FakeStateMachine {
    async fn apply(&mut self, payload: &Bytes) -> StateMachineResult {
        if self.poison.as_ref() == Some(payload) {
            return Err(StateMachineError::Failed("poisoned payload".to_string()));
        }
        self.applied.push(payload.clone());
        Ok(())
    }

    async fn create_snapshot(&self) -> Box<dyn Snapshot + Send + Sync> {
        Box::new(FakeSnapshot {
            count: self.applied.len(),
        })
    }

    async fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult {
        if self.poison.as_ref() == Some(snapshot) {
            return Err(StateMachineError::Failed("poisoned snapshot".to_string()));
        }
        self.snapshots_loaded += 1;
        self.applied.clear();
        Ok(())
    }
}
