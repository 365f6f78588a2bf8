//! Property-based generators for core types.

use common::{Member, MemberType};
use proptest::prelude::*;
use storage::{Entry, EntryKind};

pub fn entry_kind_strategy() -> impl Strategy<Value = EntryKind> {
    prop_oneof![
        Just(EntryKind::NoOp),
        Just(EntryKind::Command),
        Just(EntryKind::Configuration),
    ]
}

/// Arbitrary entries with bounded keys and payloads.
pub fn entry_strategy() -> impl Strategy<Value = Entry> {
    (
        1..10_000u64,
        1..100u64,
        entry_kind_strategy(),
        proptest::collection::vec(any::<u8>(), 0..64),
        proptest::collection::vec(any::<u8>(), 0..512),
        0..u64::MAX / 2,
    )
        .prop_map(|(index, term, kind, key, payload, timestamp)| Entry {
            index,
            term,
            kind,
            key,
            payload,
            timestamp,
        })
}

pub fn member_type_strategy() -> impl Strategy<Value = MemberType> {
    prop_oneof![
        Just(MemberType::Active),
        Just(MemberType::Passive),
        Just(MemberType::Remote),
    ]
}

/// Arbitrary member records.
pub fn member_strategy() -> impl Strategy<Value = Member> {
    (
        1..64u32,
        member_type_strategy(),
        "[a-z0-9.:]{1,24}",
        0..1_000u64,
        0..1_000u64,
        0..50u64,
    )
        .prop_map(
            |(id, member_type, address, commit_index, recycle_index, version)| Member {
                id,
                member_type,
                address,
                commit_index,
                recycle_index,
                version,
            },
        )
}
