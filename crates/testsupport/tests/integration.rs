//! Harness self-tests plus property-based round-trips over the codecs.

use buffer::Buffer;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use protocol::{frame, Operation, Request, SubmitRequest};
use std::io::Cursor;
use std::time::Duration;
use storage::Entry;
use testsupport::prelude::*;
use testsupport::proptest_generators::{entry_strategy, member_strategy};

#[tokio::test(flavor = "multi_thread")]
async fn harness_elects_and_replicates() {
    let mut cluster = TestCluster::spawn(1, 0).unwrap();
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert_eq!(leader, 1);

    cluster.submit_set(leader, "smoke", "ok").await.unwrap();
    assert_eq!(cluster.kv(leader).get("smoke"), Some(b"ok".to_vec()));
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_context_validates_membership() {
    use raft::RaftContext;
    use std::sync::Arc;
    use tempfile::tempdir;

    init_logging();
    let dir = tempdir().unwrap();
    let config = single_node_config(dir.path());

    // Id 2 is not in the seed membership.
    let (machine, _) = KvStateMachine::new();
    let err = RaftContext::open(2, config.clone(), Arc::new(NullTransport), machine).unwrap_err();
    assert!(matches!(err, common::Error::Config(_)));

    // The seeded member elects itself even over a dead transport.
    let (machine, kv) = KvStateMachine::new();
    let handle = RaftContext::open(1, config, Arc::new(NullTransport), machine).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = handle.report().await.unwrap();
        if report.role == raft::RoleKind::Leader {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no election: {report:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle
        .submit(Operation::Command {
            key: b"k".to_vec(),
            payload: b"v".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(kv.get("k"), Some(b"v".to_vec()));
    handle.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn harness_partition_blocks_traffic() {
    let cluster = TestCluster::spawn(2, 0).unwrap();
    cluster.disconnect(2);
    // The partitioned node still answers its own handle.
    let report = cluster.handle(2).report().await.unwrap();
    assert_eq!(report.id, 2);
    cluster.reconnect(2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn entry_disk_codec_roundtrip(entry in entry_strategy()) {
        let mut buf = Buffer::with_capacity(entry.record_len() + 16);
        entry.encode(&mut buf.writer()).unwrap();
        prop_assert_eq!(buf.limit(), entry.record_len());

        let decoded = Entry::decode(&mut buf.reader(), entry.index).unwrap();
        prop_assert_eq!(decoded, entry);
    }

    #[test]
    fn submit_frame_roundtrip(key in proptest::collection::vec(any::<u8>(), 0..64),
                              payload in proptest::collection::vec(any::<u8>(), 0..256),
                              correlation in any::<u64>()) {
        let request = Request::Submit(SubmitRequest {
            operation: Operation::Command { key, payload },
        });
        let mut buf = Vec::new();
        frame::write_request(&mut buf, correlation, &request).unwrap();
        let (decoded_correlation, decoded) = frame::read_request(&mut Cursor::new(buf)).unwrap();
        prop_assert_eq!(decoded_correlation, correlation);
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn member_record_wire_roundtrip(member in member_strategy()) {
        let bytes = bincode::serde::encode_to_vec(&member, bincode::config::standard()).unwrap();
        let (decoded, _): (common::Member, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        prop_assert_eq!(decoded, member);
    }
}
