//! The key/value state machine this server replicates.
//!
//! A command stores `key -> payload` and answers with the previous value;
//! a query payload is a key to look up.

use common::Result;
use log::debug;
use raft::StateMachine;
use std::collections::HashMap;
use storage::Entry;

#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl StateMachine for KvStore {
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        debug!(
            "apply index {}: {} byte key, {} byte value",
            entry.index,
            entry.key.len(),
            entry.payload.len()
        );
        let previous = self.data.insert(entry.key.clone(), entry.payload.clone());
        Ok(previous.unwrap_or_default())
    }

    fn query(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(self.data.get(payload).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::EntryKind;

    #[test]
    fn apply_returns_previous_value() {
        let mut store = KvStore::default();
        let first = Entry::new(1, 1, EntryKind::Command, b"k".to_vec(), b"v1".to_vec());
        assert_eq!(store.apply(&first).unwrap(), Vec::<u8>::new());

        let second = Entry::new(2, 1, EntryKind::Command, b"k".to_vec(), b"v2".to_vec());
        assert_eq!(store.apply(&second).unwrap(), b"v1".to_vec());
        assert_eq!(store.query(b"k").unwrap(), b"v2".to_vec());
        assert_eq!(store.query(b"missing").unwrap(), Vec::<u8>::new());
    }
}
