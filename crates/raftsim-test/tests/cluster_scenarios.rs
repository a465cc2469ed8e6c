//! End-to-end cluster scenarios over the simulated fabric

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use raftsim_core::{node_ids, Envelope, NodeId, SimError};
use raftsim_engine::{RaftMessage, RaftNode};
use raftsim_test::logging::init_tracing;
use raftsim_test::{ClusterDriver, FaultConfig, FaultPolicy, Lifecycle};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Poll until every running node follows the same leader in the same term
async fn wait_for_agreement(cluster: &ClusterDriver<RaftNode>, timeout: Duration) -> NodeId {
    let deadline = Instant::now() + timeout;
    loop {
        let statuses = cluster.statuses();
        if let Some(first) = statuses.first() {
            let agreed = first.leader.is_some()
                && statuses
                    .iter()
                    .all(|s| s.leader == first.leader && s.term == first.term);
            if agreed {
                if let Some(leader) = first.leader {
                    return leader;
                }
            }
        }
        assert!(Instant::now() < deadline, "cluster did not converge: {statuses:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until a quorum follows a leader other than `old`
async fn wait_for_new_leader(
    cluster: &ClusterDriver<RaftNode>,
    old: NodeId,
    timeout: Duration,
) -> NodeId {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let leader = cluster.wait_for_leader(remaining).await.unwrap();
        if leader != old {
            return leader;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_five_nodes_elect_a_leader() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=5), FaultPolicy::seeded(1)).unwrap();

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!(cluster.ids().contains(&leader));
    assert!(cluster.node(leader).unwrap().status().is_leader());

    cluster.check_election_safety().unwrap();
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_b_only_majority_side_elects() {
    init_tracing();
    let policy = FaultPolicy::seeded(7);
    policy.partition([node_ids([1, 2]), node_ids([3, 4, 5])]);
    let cluster = ClusterDriver::new(&node_ids(1..=5), policy).unwrap();

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!([3, 4, 5].contains(&leader.get()), "minority side won: {leader}");

    let until = Instant::now() + Duration::from_secs(2);
    while Instant::now() < until {
        for id in node_ids([1, 2]) {
            let status = cluster.node(id).unwrap().status();
            assert!(!status.is_leader(), "minority node {id} leads");
            assert_eq!(status.leader, None);
        }
        cluster.check_election_safety().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.heal();
    let leader = wait_for_agreement(&cluster, Duration::from_secs(10)).await;
    assert!(cluster.node(leader).unwrap().status().is_leader());
    cluster.check_election_safety().unwrap();
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_c_lossy_network_with_concurrent_proposals_stops_cleanly() {
    init_tracing();
    let policy = FaultPolicy::seeded(42);
    policy.set_drop_rate(0.3);
    policy.set_delay_range(Duration::ZERO, Duration::from_millis(5));
    let cluster = Arc::new(ClusterDriver::new(&node_ids(1..=5), policy).unwrap());

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut proposers = JoinSet::new();
    for id in cluster.ids() {
        let cluster = Arc::clone(&cluster);
        proposers.spawn(async move {
            let mut accepted = 0usize;
            let mut seq = 0u64;
            while Instant::now() < deadline {
                let data = Bytes::from(format!("{id}-{seq}"));
                seq += 1;
                if cluster.propose(id, data).await.is_ok() {
                    accepted += 1;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            accepted
        });
    }

    let mut accepted = 0;
    while let Some(res) = proposers.join_next().await {
        accepted += res.unwrap();
    }
    assert!(accepted > 0);
    assert!(cluster.nodes().any(|n| n.committed_len() > 0));
    cluster.check_election_safety().unwrap();

    tokio::time::timeout(Duration::from_secs(5), cluster.stop_all())
        .await
        .expect("stop_all did not return");

    for node in cluster.nodes() {
        assert_eq!(node.lifecycle(), Lifecycle::Stopped);
    }
    assert_eq!(cluster.fabric().in_flight(), 0);
    assert!(cluster.fabric().registered().is_empty());

    let stats = cluster.stats();
    assert!(stats.dropped_random > 0);
    assert!(stats.delivered > 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_send_to_unregistered_node_fails() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=3), FaultPolicy::seeded(3)).unwrap();

    let envelope = Envelope::new(
        NodeId(1),
        NodeId(99),
        1,
        RaftMessage::Propose {
            data: Bytes::from_static(b"lost"),
        },
    );
    assert_eq!(
        cluster.fabric().send(envelope),
        Err(SimError::UnknownPeer(NodeId(99)))
    );
    assert_eq!(cluster.stats().unknown_peer, 1);

    // The rest of the cluster is unaffected
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn proposals_commit_in_order_on_every_node() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=3), FaultPolicy::seeded(5)).unwrap();
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let expected: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("v{i}"))).collect();
    for data in &expected {
        cluster.propose(leader, data.clone()).await.unwrap();
    }
    cluster
        .wait_for_commit(expected.len(), Duration::from_secs(5))
        .await
        .unwrap();

    for node in cluster.nodes() {
        assert_eq!(node.committed_data(), expected, "node {}", node.id());
    }
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn follower_proposals_reach_the_log() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=3), FaultPolicy::seeded(6)).unwrap();
    let leader = wait_for_agreement(&cluster, Duration::from_secs(5)).await;
    let follower = cluster.ids().into_iter().find(|id| *id != leader).unwrap();

    cluster.propose(follower, "via-follower").await.unwrap();
    cluster.wait_for_commit(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        cluster.node(leader).unwrap().committed_data(),
        vec![Bytes::from_static(b"via-follower")]
    );
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn majority_replaces_a_cut_off_leader() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=5), FaultPolicy::seeded(11)).unwrap();
    let old = wait_for_agreement(&cluster, Duration::from_secs(5)).await;
    let buddy = cluster.ids().into_iter().find(|id| *id != old).unwrap();
    let rest: Vec<NodeId> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != old && *id != buddy)
        .collect();

    cluster.partition([vec![old, buddy], rest.clone()]);
    let new = wait_for_new_leader(&cluster, old, Duration::from_secs(10)).await;
    assert!(rest.contains(&new));
    cluster.check_election_safety().unwrap();

    cluster.heal();
    let leader = wait_for_agreement(&cluster, Duration::from_secs(10)).await;
    cluster.check_election_safety().unwrap();

    cluster.propose(leader, "after-heal").await.unwrap();
    cluster.wait_for_commit(1, Duration::from_secs(5)).await.unwrap();
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn paused_leader_is_replaced_and_steps_down_on_resume() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=3), FaultPolicy::seeded(13)).unwrap();
    let old = wait_for_agreement(&cluster, Duration::from_secs(5)).await;
    let old_term = cluster.node(old).unwrap().status().term;

    cluster.node(old).unwrap().pause();
    let new = wait_for_new_leader(&cluster, old, Duration::from_secs(10)).await;
    assert_ne!(new, old);

    cluster.node(old).unwrap().resume();
    let leader = wait_for_agreement(&cluster, Duration::from_secs(10)).await;
    assert!(cluster.node(leader).unwrap().status().term > old_term);
    assert_eq!(cluster.leader_history().get(&old_term), Some(&old));
    cluster.check_election_safety().unwrap();
    cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn hostile_preset_keeps_election_safety() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=5), FaultPolicy::seeded(17)).unwrap();
    cluster.inject_faults(FaultConfig::hostile());

    let until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < until {
        cluster.check_election_safety().unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cluster.inject_faults(FaultConfig::reliable());
    wait_for_agreement(&cluster, Duration::from_secs(10)).await;
    cluster.stop_all().await;
    assert_eq!(cluster.fabric().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_all_is_idempotent() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=3), FaultPolicy::seeded(19)).unwrap();
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    cluster.stop_all().await;
    cluster.stop_all().await;
    cluster.node(NodeId(2)).unwrap().stop().await;

    assert!(cluster.statuses().is_empty());
    assert!(matches!(
        cluster.wait_for_leader(Duration::from_millis(50)).await,
        Err(SimError::NoLeaderElected { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_a_on_multi_thread_runtime() {
    init_tracing();
    let cluster = ClusterDriver::new(&node_ids(1..=5), FaultPolicy::seeded(23)).unwrap();

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!(cluster.ids().contains(&leader));
    cluster.stop_all().await;
}
