//! The copy-on-write membership view and its gossip merge.
//!
//! Every member carries a version counter bumped by its owner on each local
//! change; views merge last-writer-wins per member. Reads hand out the
//! current `Arc`'d map; updates clone, mutate, and swap, so a reader never
//! observes a half-applied change.

use common::{Index, Member, MemberId, MemberType};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// The cluster membership view.
#[derive(Clone, Debug)]
pub struct Members {
    inner: Arc<HashMap<MemberId, Member>>,
}

impl Members {
    pub fn new(seed: &[Member]) -> Self {
        Self {
            inner: Arc::new(seed.iter().map(|m| (m.id, m.clone())).collect()),
        }
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.inner.get(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.inner.values()
    }

    /// All records, for gossip bodies and configuration entries.
    pub fn all(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.inner.values().cloned().collect();
        members.sort_by_key(|m| m.id);
        members
    }

    /// Voting (active) members.
    pub fn voting(&self) -> impl Iterator<Item = &Member> {
        self.inner.values().filter(|m| m.is_voting())
    }

    /// Passive members.
    pub fn passive(&self) -> impl Iterator<Item = &Member> {
        self.inner
            .values()
            .filter(|m| m.member_type == MemberType::Passive)
    }

    /// Majority of the active members.
    pub fn quorum(&self) -> usize {
        self.voting().count() / 2 + 1
    }

    fn update<F: FnOnce(&mut HashMap<MemberId, Member>)>(&mut self, f: F) {
        let mut map = (*self.inner).clone();
        f(&mut map);
        self.inner = Arc::new(map);
    }

    /// Merge gossiped records, last-writer-wins by version. Unknown members
    /// are adopted. Returns whether anything changed.
    pub fn merge(&mut self, records: &[Member]) -> bool {
        let changed: Vec<&Member> = records
            .iter()
            .filter(|r| match self.inner.get(&r.id) {
                Some(existing) => r.version > existing.version,
                None => true,
            })
            .collect();
        if changed.is_empty() {
            return false;
        }
        self.update(|map| {
            for record in changed {
                debug!(
                    "membership merge: member {} now at version {}",
                    record.id, record.version
                );
                map.insert(record.id, record.clone());
            }
        });
        true
    }

    /// Refresh the local member's progress, bumping its version so the
    /// change propagates through gossip.
    pub fn record_local_progress(
        &mut self,
        id: MemberId,
        commit_index: Index,
        recycle_index: Index,
    ) {
        let stale = match self.inner.get(&id) {
            Some(m) => m.commit_index != commit_index || m.recycle_index != recycle_index,
            None => false,
        };
        if stale {
            self.update(|map| {
                if let Some(m) = map.get_mut(&id) {
                    m.commit_index = commit_index;
                    m.recycle_index = recycle_index;
                    m.version += 1;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<Member> {
        vec![
            Member::new(1, "127.0.0.1:5001", MemberType::Active),
            Member::new(2, "127.0.0.1:5002", MemberType::Active),
            Member::new(3, "127.0.0.1:5003", MemberType::Active),
            Member::new(4, "127.0.0.1:5004", MemberType::Passive),
        ]
    }

    #[test]
    fn quorum_counts_only_voting_members() {
        let members = Members::new(&seed());
        assert_eq!(members.len(), 4);
        assert_eq!(members.voting().count(), 3);
        assert_eq!(members.passive().count(), 1);
        assert_eq!(members.quorum(), 2);
    }

    #[test]
    fn merge_is_last_writer_wins_by_version() {
        let mut members = Members::new(&seed());

        let mut newer = members.get(2).unwrap().clone();
        newer.commit_index = 50;
        newer.version = 3;

        let mut older = members.get(3).unwrap().clone();
        older.commit_index = 99;
        older.version = 0; // same version as the seeded record

        assert!(members.merge(&[newer.clone(), older]));
        assert_eq!(members.get(2).unwrap().commit_index, 50);
        // The equal-version record loses.
        assert_eq!(members.get(3).unwrap().commit_index, 0);

        // Re-merging the same records changes nothing.
        assert!(!members.merge(&[newer]));
    }

    #[test]
    fn merge_adopts_unknown_members() {
        let mut members = Members::new(&seed());
        let newcomer = Member::new(9, "127.0.0.1:5009", MemberType::Passive);
        assert!(members.merge(&[newcomer]));
        assert!(members.get(9).is_some());
        assert_eq!(members.len(), 5);
    }

    #[test]
    fn local_progress_bumps_version() {
        let mut members = Members::new(&seed());
        let before = members.get(1).unwrap().version;

        members.record_local_progress(1, 10, 0);
        let after = members.get(1).unwrap();
        assert_eq!(after.commit_index, 10);
        assert_eq!(after.version, before + 1);

        // No change, no bump.
        let version = after.version;
        members.record_local_progress(1, 10, 0);
        assert_eq!(members.get(1).unwrap().version, version);
    }

    #[test]
    fn snapshot_reads_are_stable_across_updates() {
        let mut members = Members::new(&seed());
        let snapshot = members.clone();
        members.record_local_progress(1, 10, 0);
        assert_eq!(snapshot.get(1).unwrap().commit_index, 0);
        assert_eq!(members.get(1).unwrap().commit_index, 10);
    }
}
