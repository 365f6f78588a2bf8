//! A key/value state machine for tests, mirroring what a real resource
//! built on the log would look like. Commands store `key -> payload` and
//! return the previous value; queries look a key up.

use common::{Index, Result};
use raft::StateMachine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage::Entry;

#[derive(Debug, Default)]
pub struct KvState {
    pub data: HashMap<Vec<u8>, Vec<u8>>,
    /// Indexes applied, in order, for assertion on apply ordering.
    pub applied: Vec<Index>,
}

/// The state machine half, handed to the Raft context.
pub struct KvStateMachine {
    state: Arc<Mutex<KvState>>,
}

/// The inspection half, kept by the test.
#[derive(Clone)]
pub struct KvHandle {
    state: Arc<Mutex<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> (Self, KvHandle) {
        let state = Arc::new(Mutex::new(KvState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            KvHandle { state },
        )
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let mut state = self.state.lock().expect("kv state poisoned");
        state.applied.push(entry.index);
        let previous = state.data.insert(entry.key.clone(), entry.payload.clone());
        Ok(previous.unwrap_or_default())
    }

    fn query(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock().expect("kv state poisoned");
        Ok(state.data.get(payload).cloned().unwrap_or_default())
    }
}

impl KvHandle {
    /// Current value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("kv state poisoned")
            .data
            .get(key.as_bytes())
            .cloned()
    }

    /// Snapshot of the whole map.
    pub fn data(&self) -> HashMap<Vec<u8>, Vec<u8>> {
        self.state.lock().expect("kv state poisoned").data.clone()
    }

    /// Indexes applied so far, in order.
    pub fn applied(&self) -> Vec<Index> {
        self.state.lock().expect("kv state poisoned").applied.clone()
    }

    /// Whether applied indexes are strictly ascending.
    pub fn applied_in_order(&self) -> bool {
        let applied = self.applied();
        applied.windows(2).all(|w| w[0] < w[1])
    }
}
