//! Durable node metadata: the current term and vote.
//!
//! Raft requires the vote to hit disk before the response leaves the node,
//! or a restart could double-vote within one term. The state lives in a
//! small JSON file written through a temp file and atomic rename.

use common::{MemberId, Result, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Persistent per-node consensus state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Current term.
    pub term: Term,
    /// Whom we voted for in the current term, if anyone.
    pub voted_for: Option<MemberId>,
}

/// Reader/writer for the `{name}.meta` file.
pub struct MetaStore {
    path: PathBuf,
    directory: PathBuf,
}

impl MetaStore {
    pub fn new(directory: &Path, name: &str) -> Self {
        Self {
            path: directory.join(format!("{name}.meta")),
            directory: directory.to_path_buf(),
        }
    }

    /// Load persisted state; a missing file yields the default.
    pub fn load(&self) -> Result<NodeMeta> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)
                .map_err(|e| common::Error::Storage(format!("unreadable meta file: {e}")))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist state durably: temp file, fsync, atomic rename, directory
    /// fsync.
    pub fn save(&self, meta: &NodeMeta) -> Result<()> {
        let temp = self.path.with_extension("meta.tmp");
        let contents = serde_json::to_string_pretty(meta)
            .map_err(|e| common::Error::Storage(format!("meta serialization failed: {e}")))?;
        fs::write(&temp, &contents)?;

        let file = File::open(&temp)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;

        let dir = File::open(&self.directory)?;
        dir.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path(), "node");
        assert_eq!(store.load().unwrap(), NodeMeta::default());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path(), "node");
        let meta = NodeMeta {
            term: 7,
            voted_for: Some(3),
        };
        store.save(&meta).unwrap();
        assert_eq!(store.load().unwrap(), meta);

        // A fresh store over the same directory sees the same state.
        let store = MetaStore::new(dir.path(), "node");
        assert_eq!(store.load().unwrap(), meta);
    }

    #[test]
    fn save_overwrites_previous_state() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path(), "node");
        store
            .save(&NodeMeta {
                term: 1,
                voted_for: Some(1),
            })
            .unwrap();
        store
            .save(&NodeMeta {
                term: 2,
                voted_for: None,
            })
            .unwrap();
        assert_eq!(
            store.load().unwrap(),
            NodeMeta {
                term: 2,
                voted_for: None
            }
        );
    }
}
