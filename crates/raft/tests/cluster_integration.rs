//! End-to-end cluster scenarios over the in-memory transport.

use common::{Error, Member, MemberType};
use protocol::{
    Consistency, ErrorKind, PollRequest, Request, Response, Status, VoteRequest,
};
use raft::RoleKind;
use std::time::Duration;
use testsupport::prelude::*;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn single_node_commit() {
    let mut cluster = TestCluster::spawn(1, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    assert_eq!(leader, 1);

    let previous = cluster.submit_set(leader, "foo", "1").await.unwrap();
    assert!(previous.is_empty(), "no prior value for foo");

    let report = cluster.handle(leader).report().await.unwrap();
    assert_eq!(report.term, 1);
    // Index 1 is the leader's no-op, index 2 the command.
    assert_eq!(report.last_index, 2);
    assert_eq!(report.commit_index, 2);
    assert_eq!(report.last_applied, 2);

    assert_eq!(cluster.kv(leader).get("foo"), Some(b"1".to_vec()));
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_happy_path() {
    let mut cluster = TestCluster::spawn(3, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();

    for n in 0..20 {
        cluster
            .submit_set(leader, &format!("key-{n}"), &format!("value-{n}"))
            .await
            .unwrap();
    }

    // Every node converges to the same applied state: 1 no-op + 20 commands.
    let reports = cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .all(|r| r.commit_index == 21 && r.last_applied == 21)
        })
        .await
        .unwrap();
    assert!(reports.iter().all(|r| r.last_index == 21));

    let leader_data = cluster.kv(leader).data();
    assert_eq!(leader_data.len(), 20);
    for id in cluster.ids() {
        assert_eq!(cluster.kv(id).data(), leader_data, "node {id} diverged");
        assert!(cluster.kv(id).applied_in_order(), "node {id} applied out of order");
    }

    // Exactly one leader in the final term.
    let leaders: Vec<_> = reports
        .iter()
        .filter(|r| r.role == RoleKind::Leader)
        .collect();
    assert_eq!(leaders.len(), 1);
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_to_follower_redirects() {
    let mut cluster = TestCluster::spawn(3, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    let follower = cluster.ids().into_iter().find(|&id| id != leader).unwrap();

    // Followers learn the leader from heartbeats before we ask.
    cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .find(|r| r.id == follower)
                .is_some_and(|r| r.leader == Some(leader))
        })
        .await
        .unwrap();

    match cluster.submit_set(follower, "foo", "1").await {
        Err(Error::NoLeader { leader: hint }) => assert_eq!(hint, Some(leader)),
        other => panic!("expected a no-leader redirect, got {other:?}"),
    }
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_member_rejects_consensus_rpcs() {
    let mut cluster = TestCluster::spawn(2, 1).unwrap();
    cluster.wait_for_leader(WAIT).await.unwrap();
    let passive = cluster.handle(3);

    let vote = passive
        .handle(Request::Vote(VoteRequest {
            term: 99,
            candidate: 1,
            last_log_index: 0,
            last_log_term: 0,
        }))
        .await
        .unwrap();
    match vote {
        Response::Vote(r) => {
            assert_eq!(r.status, Status::Error);
            assert_eq!(r.error, Some(ErrorKind::IllegalMemberState));
            assert!(!r.vote_granted);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let poll = passive
        .handle(Request::Poll(PollRequest {
            term: 99,
            candidate: 1,
            last_log_index: 0,
            last_log_term: 0,
        }))
        .await
        .unwrap();
    match poll {
        Response::Poll(r) => assert_eq!(r.error, Some(ErrorKind::IllegalMemberState)),
        other => panic!("unexpected response {other:?}"),
    }
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_member_catches_up_through_gossip() {
    let mut cluster = TestCluster::spawn(2, 1).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();

    for n in 0..30 {
        cluster
            .submit_set(leader, &format!("key-{n}"), &format!("value-{n}"))
            .await
            .unwrap();
    }

    // The passive member converges on the committed prefix without ever
    // voting or leading.
    cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .find(|r| r.id == 3)
                .is_some_and(|r| r.last_applied == 31 && r.role == RoleKind::Passive)
        })
        .await
        .unwrap();

    assert_eq!(cluster.kv(3).data(), cluster.kv(leader).data());
    assert!(cluster.kv(3).applied_in_order());

    // Gossip also carried the passive member's progress back: the leader's
    // view shows it caught up.
    cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .find(|r| r.id == leader)
                .is_some_and(|r| {
                    r.members
                        .iter()
                        .any(|m: &Member| m.id == 3 && m.commit_index == 31)
                })
        })
        .await
        .unwrap();
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_steps_down_and_heals() {
    let mut cluster = TestCluster::spawn(3, 0).unwrap();
    let old_leader = cluster.wait_for_leader(WAIT).await.unwrap();

    cluster.submit_set(old_leader, "a", "1").await.unwrap();
    cluster.submit_set(old_leader, "b", "2").await.unwrap();
    cluster
        .wait_until(WAIT, |reports| reports.iter().all(|r| r.last_applied == 3))
        .await
        .unwrap();

    // Cut the leader off, then fire a doomed submit into it.
    cluster.disconnect(old_leader);
    let doomed_handle = cluster.handle(old_leader);
    let doomed = tokio::spawn(async move {
        doomed_handle
            .submit(protocol::Operation::Command {
                key: b"orphan".to_vec(),
                payload: b"lost".to_vec(),
            })
            .await
    });

    // The majority side elects a replacement in a higher term.
    let new_leader = cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .any(|r| r.id != old_leader && r.role == RoleKind::Leader)
        })
        .await
        .map(|reports| {
            reports
                .iter()
                .filter(|r| r.role == RoleKind::Leader && r.id != old_leader)
                .max_by_key(|r| r.term)
                .unwrap()
                .id
        })
        .unwrap();

    for n in 0..3 {
        cluster
            .submit_set(new_leader, &format!("post-{n}"), "x")
            .await
            .unwrap();
    }

    // Heal. The deposed leader adopts the higher term, truncates its
    // divergent suffix, and matches the new leader's log.
    cluster.reconnect(old_leader);
    let reports = cluster
        .wait_until(WAIT, |reports| {
            let new_term = reports.iter().map(|r| r.term).max().unwrap_or(0);
            reports.iter().all(|r| {
                r.term == new_term
                    && r.last_applied == r.commit_index
                    && r.commit_index == reports[0].commit_index
            }) && reports
                .iter()
                .find(|r| r.id == old_leader)
                .is_some_and(|r| r.role == RoleKind::Follower)
        })
        .await
        .unwrap();

    let new_leader_data = cluster.kv(new_leader).data();
    for report in &reports {
        assert_eq!(cluster.kv(report.id).data(), new_leader_data);
    }
    // The orphaned command never committed anywhere.
    assert!(!new_leader_data.contains_key(b"orphan".as_slice()));
    match doomed.await.unwrap() {
        Err(Error::NoLeader { .. }) => {}
        other => panic!("expected the in-flight submit to fail, got {other:?}"),
    }
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn query_consistency_levels() {
    let mut cluster = TestCluster::spawn(3, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    cluster.submit_set(leader, "foo", "1").await.unwrap();

    // Linearizable reads at the leader, both flavors.
    let strict = cluster
        .query(leader, "foo", Consistency::LinearizableStrict)
        .await
        .unwrap();
    assert_eq!(strict, b"1".to_vec());
    let lease = cluster
        .query(leader, "foo", Consistency::LinearizableLease)
        .await
        .unwrap();
    assert_eq!(lease, b"1".to_vec());

    // Serializable reads serve from any node once it has applied.
    let follower = cluster.ids().into_iter().find(|&id| id != leader).unwrap();
    cluster
        .wait_until(WAIT, |reports| {
            reports
                .iter()
                .find(|r| r.id == follower)
                .is_some_and(|r| r.last_applied >= 2)
        })
        .await
        .unwrap();
    let local = cluster
        .query(follower, "foo", Consistency::Serializable)
        .await
        .unwrap();
    assert_eq!(local, b"1".to_vec());

    // Linearizable reads refuse on a non-leader.
    match cluster
        .query(follower, "foo", Consistency::LinearizableStrict)
        .await
    {
        Err(Error::NoLeader { .. }) => {}
        other => panic!("expected a no-leader error, got {other:?}"),
    }
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_restart_recovers_state() {
    let mut cluster = TestCluster::spawn(1, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    let term_before = cluster.handle(leader).report().await.unwrap().term;

    for n in 0..3 {
        cluster
            .submit_set(leader, &format!("key-{n}"), &format!("value-{n}"))
            .await
            .unwrap();
    }

    cluster.restart(1).await.unwrap();
    cluster.wait_for_leader(WAIT).await.unwrap();

    // The fresh state machine is rebuilt from the recovered log once the
    // new term's no-op commits.
    cluster
        .wait_until(WAIT, |reports| {
            reports[0].last_applied == reports[0].last_index && reports[0].last_index >= 4
        })
        .await
        .unwrap();
    let kv = cluster.kv(1);
    for n in 0..3 {
        assert_eq!(
            kv.get(&format!("key-{n}")),
            Some(format!("value-{n}").into_bytes())
        );
    }

    // The term is durable: the reopened node elects in a later term.
    let report = cluster.handle(1).report().await.unwrap();
    assert!(report.term > term_before);
    cluster.close_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reconfigure_replicates_membership() {
    let mut cluster = TestCluster::spawn(1, 0).unwrap();
    let leader = cluster.wait_for_leader(WAIT).await.unwrap();

    let mut members = cluster.handle(leader).report().await.unwrap().members;
    let mut newcomer = Member::new(9, "mem://9", MemberType::Passive);
    newcomer.version = 1;
    members.push(newcomer);
    cluster.handle(leader).reconfigure(members).await.unwrap();

    cluster
        .wait_until(WAIT, |reports| {
            reports[0].members.iter().any(|m| m.id == 9)
        })
        .await
        .unwrap();
    cluster.close_all().await.unwrap();
}
