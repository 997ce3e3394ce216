use rand::prelude::SliceRandom;

use myha_local_cluster::{fast_config, local_cluster_tester::LocalClusterRunner};
use myha_raft::msg::{HaCommand, RetCode, State};

/// Failover scenarios run against an in-process cluster with simulated
/// MySQL. Timings come from `fast_config`.

#[tokio::test]
async fn initial_election() {
    let cr = LocalClusterRunner::new(3).unwrap();

    let leader = cr.check_one_leader().await.unwrap();
    cr.wait_for(|nodes| {
        nodes
            .iter()
            .filter(|n| n.id != leader.id)
            .all(|n| n.status.state == State::Follower && n.status.leader.as_ref() == Some(&leader.id))
    })
    .await
    .unwrap();
    assert!(cr.live_view_agreement().await.unwrap());

    cr.sleep_windows(3).await;
    assert_eq!(leader.id, cr.check_one_leader().await.unwrap().id);
    assert!(cr.all_follow(&leader.id).await.unwrap());
}

#[tokio::test]
async fn stopped_leader_rejoins_as_follower() {
    let cr = LocalClusterRunner::new(3).unwrap();

    let leader1 = cr.check_one_leader().await.unwrap();
    cr.kill(&leader1.id).await.unwrap();
    let leader2 = cr.check_one_leader().await.unwrap();
    assert_ne!(leader1.id, leader2.id);

    cr.start(&leader1.id).await.unwrap();
    cr.sleep_windows(2).await;
    assert_eq!(leader2.id, cr.check_one_leader().await.unwrap().id);

    let rejoined = cr.node(&leader1.id).await.unwrap();
    assert_eq!(rejoined.status.state, State::Follower);
    assert_eq!(rejoined.status.leader.as_ref(), Some(&leader2.id));
}

#[tokio::test]
async fn most_advanced_replica_wins() {
    let cr = LocalClusterRunner::with_setup(3, fast_config(), |i, node| {
        node.mysql().set_position("mysql-bin.000001", 122 + i as u64);
    })
    .unwrap();
    let ids = cr.ids().to_vec();

    let leader = cr.check_one_leader().await.unwrap();
    assert_eq!(leader.id, ids[2]);

    cr.kill(&ids[2]).await.unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    assert_eq!(leader.id, ids[1]);
}

#[tokio::test]
async fn added_peer_reaches_every_member() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    let epoch = leader.status.epoch_id;
    let new_peer = "127.0.0.1:7000";

    cr.add_peer(&leader.id, new_peer).await.unwrap();
    let nodes = cr
        .wait_for(|nodes| {
            nodes.iter().all(|n| {
                n.status.epoch_id == epoch + 1 && n.status.peers.iter().any(|p| p == new_peer)
            })
        })
        .await
        .unwrap();
    // Every member lists the others, never itself.
    assert!(nodes.iter().all(|n| n.status.peers.len() == 3));
    assert!(nodes.iter().all(|n| !n.status.peers.contains(&n.id)));
}

#[tokio::test]
async fn isolated_leader_admits_defeat() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    for id in cr.ids().iter().filter(|id| **id != leader.id) {
        cr.disconnect(id).await.unwrap();
    }

    let nodes = cr
        .wait_for(|nodes| {
            nodes
                .iter()
                .any(|n| n.id == leader.id && n.status.state != State::Leader)
        })
        .await
        .unwrap();
    let old = nodes.iter().find(|n| n.id == leader.id).unwrap();
    assert!(old.status.stats.heartbeat_loss >= u64::from(cr.config().admit_defeat_ht_cnt));
    assert!(old.status.stats.degrades >= 1);
}

#[tokio::test]
async fn idle_member_never_counts_toward_quorum() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    let idle = cr
        .ids()
        .iter()
        .find(|id| **id != leader.id)
        .cloned()
        .unwrap();

    assert_eq!(cr.ha(&idle, HaCommand::Disable).await.unwrap(), RetCode::Ok);
    cr.wait_for(|nodes| nodes.iter().any(|n| n.id == idle && n.status.state == State::Idle))
        .await
        .unwrap();

    // The last voting follower plus an Idle ack is not a quorum.
    cr.kill(&leader.id).await.unwrap();
    cr.sleep_windows(3).await;
    assert!(cr.has_no_leader().await.unwrap());
    assert_eq!(cr.node(&idle).await.unwrap().status.state, State::Idle);

    cr.start(&leader.id).await.unwrap();
    let new_leader = cr.check_one_leader().await.unwrap();
    assert_ne!(new_leader.id, idle);
    cr.wait_for(|nodes| {
        nodes.iter().any(|n| {
            n.id == idle
                && n.status.state == State::Idle
                && n.status.leader.as_ref() == Some(&new_leader.id)
        })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn leader_survives_random_partitions() {
    let node_count = 5;
    let cr = LocalClusterRunner::new(node_count).unwrap();
    let ids = cr.ids().to_vec();

    cr.check_one_leader().await.unwrap();
    for _ in 0..5 {
        // disconnect a minority
        let mut choices = ids.clone();
        choices.shuffle(&mut rand::thread_rng());
        let (n1, n2) = (&choices[0], &choices[1]);
        cr.disconnect(n1).await.unwrap();
        cr.disconnect(n2).await.unwrap();

        // either the current leader is still connected, or the remaining
        // three elect a new one.
        cr.check_one_leader().await.unwrap();

        cr.connect(n1).await.unwrap();
        cr.connect(n2).await.unwrap();
    }
    cr.check_one_leader().await.unwrap();
}

#[tokio::test]
async fn leader_purges_binlogs_every_replica_has_read() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();

    let nodes = cr
        .wait_for(|nodes| {
            nodes
                .iter()
                .any(|n| n.id == leader.id && n.status.stats.purges >= 1)
        })
        .await
        .unwrap();
    let leader = nodes.iter().find(|n| n.id == leader.id).unwrap();
    assert_eq!(leader.status.purge_target.as_deref(), Some("mysql-bin.000001"));
}

#[tokio::test]
async fn try_to_leader_hands_over_leadership() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    assert_eq!(cr.ha(&leader.id, HaCommand::TryToLeader).await.unwrap(), RetCode::Ok);

    let target = cr
        .ids()
        .iter()
        .find(|id| **id != leader.id)
        .cloned()
        .unwrap();
    assert_eq!(cr.ha(&target, HaCommand::TryToLeader).await.unwrap(), RetCode::Ok);
    let nodes = cr
        .wait_for(|nodes| {
            nodes
                .iter()
                .any(|n| n.id == target && n.status.state == State::Leader)
        })
        .await
        .unwrap();
    let old = nodes.iter().find(|n| n.id == leader.id).unwrap();
    assert_ne!(old.status.state, State::Leader);
}

#[tokio::test]
async fn ping_follows_network_reachability() {
    let cr = LocalClusterRunner::new(3).unwrap();
    let leader = cr.check_one_leader().await.unwrap();
    let other = cr
        .ids()
        .iter()
        .find(|id| **id != leader.id)
        .cloned()
        .unwrap();

    let resp = cr.ping(&other, &leader.id).await.unwrap();
    assert_eq!(resp.ret_code, RetCode::Ok);
    assert_eq!(resp.state, State::Leader);

    cr.disconnect(&leader.id).await.unwrap();
    let resp = cr.ping(&other, &leader.id).await.unwrap();
    assert_eq!(resp.ret_code, RetCode::RpcCall);

    cr.connect(&leader.id).await.unwrap();
    cr.kill(&other).await.unwrap();
    let resp = cr.ping(&other, &leader.id).await.unwrap();
    assert_eq!(resp.ret_code, RetCode::RpcCall);
}
