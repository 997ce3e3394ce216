use ahash::HashSet;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use super::{dispatch, Node, StateHandler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::msg::{
    HeartbeatRequest, HeartbeatResponse, NodeId, RequestVoteRequest, RequestVoteResponse, RetCode,
    State,
};
use crate::mysql::{compare_log_files, LeaderCommand, MySql};
use crate::stats::Stats;

/// Semi-sync master timeout that never falls back to async replication.
pub(crate) const SEMI_SYNC_INFINITE_TIMEOUT_MS: u64 = 1_000_000_000_000;

/// View jump applied on the first partial-quorum round. Deliberately larger
/// than the +1 of an election so the two are distinguishable.
const BRAIN_SPLIT_VIEW_BUMP: u64 = 2;

/// Acknowledgements gathered for one heartbeat fan-out.
#[derive(Debug, Default)]
struct Round {
    expected: usize,
    responded: HashSet<NodeId>,
    /// Self included; Idle members excluded.
    ack_granted: usize,
    /// Members that acknowledged and reported the binlog they still need.
    relay_acks: usize,
    min_relay_file: Option<String>,
    evaluated: bool,
}

pub(crate) struct Leader {
    heartbeat: Interval,
    purge: Interval,
    semi_sync: Interval,
    round: Round,
    acks_rx: Option<mpsc::UnboundedReceiver<HeartbeatResponse>>,
    below_quorum_rounds: u32,
    is_brain_split: bool,
    promotion_rx: Option<oneshot::Receiver<Result<()>>>,
    /// Promotion finished and the VIP start command has run.
    promoted: bool,
    /// Target of the last purge that succeeded or is still running.
    last_purged: Arc<Mutex<Option<String>>>,
}

impl Leader {
    pub fn new(config: &Config) -> Self {
        let delayed = |period: Duration| {
            let mut i = time::interval_at(Instant::now() + period, period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        };
        let mut heartbeat = time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut semi_sync = time::interval(config.check_semi_sync_interval);
        semi_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            heartbeat,
            purge: delayed(config.purge_binlog_interval),
            semi_sync,
            round: Round {
                evaluated: true,
                ..Default::default()
            },
            acks_rx: None,
            below_quorum_rounds: 0,
            is_brain_split: false,
            promotion_rx: None,
            promoted: false,
            last_purged: Arc::default(),
        }
    }

    async fn send_heartbeats(&mut self, node: &mut Node) {
        if !self.round.evaluated {
            self.evaluate_round(node);
            if node.state != State::Leader {
                return;
            }
        }

        let mysql = node.mysql();
        let gtid = mysql.gtid().await.unwrap_or_else(|e| {
            warn!(id = %node.id(), error = %e, "cannot read gtid for heartbeat");
            Default::default()
        });
        let meta = node.shared.meta();
        let peers = node.shared.advertised_peers();
        let epoch_id = node.epoch_id();
        let repl = mysql.repl();
        let targets = node.shared.heartbeat_targets();

        let (tx, rx) = mpsc::unbounded_channel();
        self.acks_rx = Some(rx);
        self.round = Round {
            expected: targets.len(),
            ack_granted: 1,
            ..Default::default()
        };
        for peer in targets {
            let req = HeartbeatRequest {
                view_id: node.view_id,
                epoch_id,
                from: node.id().to_string(),
                to: peer.addr().to_string(),
                leader: node.id().to_string(),
                peers: peers.clone(),
                idle_peers: meta.idle_peers.clone(),
                repl: repl.clone(),
                gtid: gtid.clone(),
            };
            node.spawn(peer.send_heartbeat(req, tx.clone()));
        }
        if self.round.expected == 0 {
            self.evaluate_round(node);
        }
    }

    fn on_ack(&mut self, node: &mut Node, resp: HeartbeatResponse) {
        if self.round.evaluated || !self.round.responded.insert(resp.from.clone()) {
            return;
        }
        match resp.ret_code {
            RetCode::Ok => {
                if resp.state != State::Idle && node.shared.is_peer(&resp.from) {
                    self.round.ack_granted += 1;
                }
                if let Some(file) = resp.relay_master_log_file {
                    self.round.relay_acks += 1;
                    let older = match &self.round.min_relay_file {
                        Some(min) => compare_log_files(&file, min) == CmpOrdering::Less,
                        None => true,
                    };
                    if older {
                        self.round.min_relay_file = Some(file);
                    }
                }
            }
            RetCode::InvalidViewId if resp.view_id > node.view_id => {
                warn!(
                    id = %node.id(),
                    from = %resp.from,
                    view = resp.view_id,
                    leader = ?resp.leader,
                    "stale leader, degrading"
                );
                node.update_view(resp.view_id, None);
                node.set_state(State::Follower);
                return;
            }
            code => debug!(id = %node.id(), from = %resp.from, %code, "heartbeat not acknowledged"),
        }
        if self.round.responded.len() >= self.round.expected {
            self.evaluate_round(node);
        }
    }

    /// Step-down hysteresis, split detection and purge target, once per round.
    fn evaluate_round(&mut self, node: &mut Node) {
        self.round.evaluated = true;
        Stats::incr(&node.shared.stats.heartbeat_rounds);
        let members = node.members();
        let quorum = node.quorum();
        let acks = self.round.ack_granted;

        if acks < quorum {
            if members > 2 {
                self.below_quorum_rounds += 1;
                Stats::incr(&node.shared.stats.heartbeat_loss);
                warn!(
                    id = %node.id(),
                    acks,
                    quorum,
                    rounds = self.below_quorum_rounds,
                    "heartbeat below quorum"
                );
                if self.below_quorum_rounds >= node.shared.config.admit_defeat_ht_cnt {
                    info!(id = %node.id(), view = node.view_id, "lost quorum, degrading");
                    node.set_state(State::Follower);
                    return;
                }
            }
        } else {
            self.below_quorum_rounds = 0;
            if acks == quorum && acks < members {
                if !self.is_brain_split {
                    self.is_brain_split = true;
                    let view = node.view_id + BRAIN_SPLIT_VIEW_BUMP;
                    info!(id = %node.id(), acks, members, view, "partial quorum, bumping view");
                    node.update_view(view, Some(node.id().to_string()));
                    Stats::incr(&node.shared.stats.brain_split_bumps);
                }
            } else if acks >= members {
                self.is_brain_split = false;
            }
        }

        if self.round.expected > 0 && self.round.relay_acks == self.round.expected {
            if let Some(file) = self.round.min_relay_file.take() {
                if node.purge_target.as_ref() != Some(&file) {
                    debug!(id = %node.id(), %file, "purge target advanced");
                }
                node.purge_target = Some(file);
            }
        }
    }

    fn purge_binlogs(&mut self, node: &mut Node) {
        if node.shared.skip_purge.load(Ordering::SeqCst) {
            return;
        }
        let Some(target) = node.purge_target.clone() else {
            return;
        };
        {
            let mut last = self.last_purged.lock();
            if last.as_ref() == Some(&target) {
                return;
            }
            *last = Some(target.clone());
        }
        let last_purged = self.last_purged.clone();
        let mysql = node.mysql();
        let shared = node.shared.clone();
        node.spawn(async move {
            match mysql.purge_binlogs_to(&target).await {
                Ok(()) => {
                    info!(id = %shared.id, %target, "purged binlogs");
                    Stats::incr(&shared.stats.purges);
                }
                Err(e) => {
                    warn!(id = %shared.id, %target, error = %e, "binlog purge failed");
                    Stats::incr(&shared.stats.purge_failures);
                    // Retry on the next tick.
                    let mut last = last_purged.lock();
                    if last.as_ref() == Some(&target) {
                        *last = None;
                    }
                }
            }
        });
    }

    fn check_semi_sync(&mut self, node: &mut Node) {
        let mysql = node.mysql();
        let members = node.members();
        let small_timeout = node.shared.config.semi_sync_small_cluster_timeout_ms;
        let id = node.id().to_string();
        node.spawn(async move {
            if let Err(e) = apply_semi_sync(mysql.as_ref(), members, small_timeout).await {
                warn!(%id, error = %e, "failed to apply semi-sync policy");
            }
        });
    }

    fn on_promotion_done(&mut self, node: &mut Node, result: Result<()>) {
        self.promotion_rx = None;
        match result {
            Ok(()) => {
                info!(id = %node.id(), view = node.view_id, "mysql promoted");
                self.promoted = true;
            }
            Err(e) => {
                error!(id = %node.id(), error = %e, "mysql promotion failed, degrading");
                node.set_state(State::Follower);
            }
        }
    }
}

/// Under three members a stalled replica would block commits forever, so
/// semi-sync gets a bounded timeout; otherwise a majority of replicas must
/// acknowledge with no fallback.
pub(crate) async fn apply_semi_sync(
    mysql: &dyn MySql,
    members: usize,
    small_cluster_timeout_ms: u64,
) -> Result<()> {
    mysql.enable_semi_sync_master().await?;
    if members < 3 {
        mysql.set_semi_wait_slave_count(1).await?;
        mysql.set_semi_sync_master_timeout(small_cluster_timeout_ms).await?;
    } else {
        mysql.set_semi_wait_slave_count((members - 1) / 2).await?;
        mysql.set_semi_sync_master_timeout(SEMI_SYNC_INFINITE_TIMEOUT_MS).await?;
    }
    Ok(())
}

/// Turns the local replica into the writable master. Only a failure to catch
/// up or to switch roles aborts; later steps are best effort.
async fn promote(mysql: Arc<dyn MySql>, leader_command: Arc<dyn LeaderCommand>, id: String) -> Result<()> {
    mysql.stop_slave_io_thread().await?;
    let gtid = mysql.gtid().await?;
    mysql.wait_until_after_gtid(&gtid.retrieved_gtid_set).await?;
    mysql.change_to_master().await?;

    if let Err(e) = mysql.reset_slave_all().await {
        warn!(%id, error = %e, "failed to clear replica configuration");
    }
    if let Err(e) = mysql.enable_semi_sync_master().await {
        warn!(%id, error = %e, "failed to enable semi-sync master");
    }
    if let Err(e) = mysql.set_master_global_sys_var().await {
        warn!(%id, error = %e, "failed to apply master system variables");
    }
    if let Err(e) = mysql.set_read_write().await {
        error!(%id, error = %e, "failed to set read write");
    }
    if let Err(e) = leader_command.run_leader_start_command().await {
        error!(%id, error = %e, "leader start command failed");
    }
    Ok(())
}

#[async_trait]
impl StateHandler for Leader {
    fn state(&self) -> State {
        State::Leader
    }

    async fn on_enter(&mut self, node: &mut Node) {
        Stats::incr(&node.shared.stats.promotions);
        node.leader = Some(node.id().to_string());
        info!(id = %node.id(), view = node.view_id, epoch = node.epoch_id(), "became leader");

        let (tx, rx) = oneshot::channel();
        self.promotion_rx = Some(rx);
        let mysql = node.mysql();
        let leader_command = node.leader_command();
        let id = node.id().to_string();
        node.spawn(async move {
            let _ = tx.send(promote(mysql, leader_command, id).await);
        });
    }

    async fn run_until_transition(&mut self, node: &mut Node) {
        let stop = node.shared.stop.clone();
        while node.state == State::Leader {
            let Self {
                heartbeat,
                purge,
                semi_sync,
                acks_rx,
                promotion_rx,
                ..
            } = &mut *self;
            let promotion = async {
                match promotion_rx.as_mut() {
                    Some(rx) => rx.await.unwrap_or(Err(Error::Stop)),
                    None => std::future::pending().await,
                }
            };
            let acks = async {
                match acks_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = stop.cancelled() => node.set_state(State::Stopped),
                Some(event) = node.events.recv() => dispatch(self, node, event).await,
                result = promotion => self.on_promotion_done(node, result),
                Some(resp) = acks => self.on_ack(node, resp),
                _ = heartbeat.tick() => self.send_heartbeats(node).await,
                _ = purge.tick() => self.purge_binlogs(node),
                _ = semi_sync.tick() => self.check_semi_sync(node),
            }
        }
    }

    /// Detaches the VIP only if promotion attached it. An in-flight
    /// promotion is waited for first.
    async fn on_exit(&mut self, node: &mut Node) {
        Stats::incr(&node.shared.stats.degrades);
        node.wait_tasks().await;
        if let Some(mut rx) = self.promotion_rx.take() {
            self.promoted = matches!(rx.try_recv(), Ok(Ok(())));
        }
        if self.promoted {
            if let Err(e) = node.leader_command().run_leader_stop_command().await {
                warn!(id = %node.id(), error = %e, "leader stop command failed");
            }
        }
    }

    async fn on_heartbeat(&mut self, node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse {
        if req.view_id <= node.view_id {
            debug!(id = %node.id(), from = %req.from, view = req.view_id, "rejecting rival heartbeat");
            return node.heartbeat_reply(RetCode::InvalidViewId);
        }
        info!(id = %node.id(), leader = %req.from, view = req.view_id, "newer leader, degrading");
        node.update_view(req.view_id, None);
        node.set_state(State::Follower);
        node.heartbeat_reply(RetCode::Ok)
    }

    /// Only a strictly newer view whose data is not behind ours can take over.
    async fn on_vote_request(
        &mut self,
        node: &mut Node,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        if req.view_id <= node.view_id {
            return node.vote_reply(RetCode::InvalidViewId, None);
        }
        let (ahead, local) = match node.mysql().gtid_greater_than(&req.gtid).await {
            Ok(r) => r,
            Err(e) => {
                warn!(id = %node.id(), error = %e, "cannot read local gtid for vote");
                return node.vote_reply(RetCode::MySqlDown, None);
            }
        };
        if ahead {
            info!(id = %node.id(), candidate = %req.from, "refusing vote: candidate is behind");
            return node.vote_reply(RetCode::InvalidGtid, Some(local));
        }
        info!(id = %node.id(), candidate = %req.from, view = req.view_id, "granting vote, degrading");
        node.update_view(req.view_id, None);
        node.voted_for = Some(req.from);
        node.set_state(State::Follower);
        node.vote_reply(RetCode::Ok, Some(local))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, heartbeat, vote, Fixture};
    use super::*;
    use crate::mysql::sim::SimMySql;

    fn ack(from: &str, state: State, relay: Option<&str>) -> HeartbeatResponse {
        HeartbeatResponse {
            from: from.into(),
            view_id: 1,
            epoch_id: 0,
            state,
            ret_code: RetCode::Ok,
            leader: Some("a".into()),
            relay_master_log_file: relay.map(Into::into),
        }
    }

    /// A Leader with a round of the given size waiting for answers.
    fn leader(f: &mut Fixture, expected: usize) -> Leader {
        f.node.update_view(1, Some("a".into()));
        let mut l = Leader::new(&f.node.shared.config);
        l.round = Round {
            expected,
            ack_granted: 1,
            ..Default::default()
        };
        l
    }

    #[tokio::test]
    async fn full_round_sets_purge_target_to_oldest_needed() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 3);
        l.on_ack(&mut f.node, ack("b", State::Follower, Some("mysql-bin.000012")));
        l.on_ack(&mut f.node, ack("c", State::Follower, Some("mysql-bin.000010")));
        assert!(f.node.purge_target.is_none());
        l.on_ack(&mut f.node, ack("i", State::Idle, Some("mysql-bin.000011")));
        assert!(l.round.evaluated);
        assert_eq!(f.node.purge_target.as_deref(), Some("mysql-bin.000010"));
        assert_eq!(l.below_quorum_rounds, 0);
        assert!(!l.is_brain_split);
    }

    #[tokio::test]
    async fn partial_round_keeps_purge_target() {
        let mut f = fixture(State::Leader);
        f.node.purge_target = Some("mysql-bin.000005".into());
        let mut l = leader(&mut f, 3);
        l.on_ack(&mut f.node, ack("b", State::Follower, Some("mysql-bin.000012")));
        l.on_ack(&mut f.node, ack("c", State::Follower, Some("mysql-bin.000010")));
        let mut lost = ack("i", State::Stopped, None);
        lost.ret_code = RetCode::RpcCall;
        l.on_ack(&mut f.node, lost);
        assert_eq!(f.node.purge_target.as_deref(), Some("mysql-bin.000005"));
    }

    #[tokio::test]
    async fn partial_quorum_bumps_view_by_two_once() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 3);
        l.on_ack(&mut f.node, ack("b", State::Follower, None));
        l.evaluate_round(&mut f.node);
        assert_eq!(f.node.view_id, 3);
        assert!(l.is_brain_split);
        assert_eq!(f.node.leader.as_deref(), Some("a"));

        l.round = Round { expected: 3, ack_granted: 2, ..Default::default() };
        l.evaluate_round(&mut f.node);
        assert_eq!(f.node.view_id, 3);

        l.round = Round { expected: 3, ack_granted: 3, ..Default::default() };
        l.evaluate_round(&mut f.node);
        assert!(!l.is_brain_split);
    }

    #[tokio::test]
    async fn idle_acks_do_not_count() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 3);
        l.on_ack(&mut f.node, ack("b", State::Idle, None));
        l.on_ack(&mut f.node, ack("i", State::Idle, None));
        assert_eq!(l.round.ack_granted, 1);
    }

    #[tokio::test]
    async fn admits_defeat_after_consecutive_lost_rounds() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 3);
        let rounds = f.node.shared.config.admit_defeat_ht_cnt;
        for _ in 1..rounds {
            l.round = Round { expected: 3, ack_granted: 1, ..Default::default() };
            l.evaluate_round(&mut f.node);
            assert_eq!(f.node.state, State::Leader);
        }
        l.round = Round { expected: 3, ack_granted: 1, ..Default::default() };
        l.evaluate_round(&mut f.node);
        assert_eq!(f.node.state, State::Follower);
    }

    #[tokio::test]
    async fn two_member_cluster_never_admits_defeat() {
        let mut f = fixture(State::Leader);
        f.node.shared.update_epoch(9, vec!["a".into(), "b".into()], vec![]);
        let mut l = leader(&mut f, 1);
        for _ in 0..10 {
            l.round = Round { expected: 1, ack_granted: 1, ..Default::default() };
            l.evaluate_round(&mut f.node);
        }
        assert_eq!(f.node.state, State::Leader);
    }

    #[tokio::test]
    async fn stale_view_answer_degrades() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 3);
        let mut resp = ack("b", State::Follower, None);
        resp.ret_code = RetCode::InvalidViewId;
        resp.view_id = 7;
        resp.leader = Some("c".into());
        l.on_ack(&mut f.node, resp);
        assert_eq!(f.node.state, State::Follower);
        assert_eq!(f.node.view_id, 7);
    }

    #[tokio::test]
    async fn vote_needs_newer_view_and_data() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        f.mysql.set_position("mysql-bin.000001", 124);

        let resp = l.on_vote_request(&mut f.node, vote("b", 1, 200)).await;
        assert_eq!(resp.ret_code, RetCode::InvalidViewId);
        let resp = l.on_vote_request(&mut f.node, vote("b", 2, 123)).await;
        assert_eq!(resp.ret_code, RetCode::InvalidGtid);
        assert_eq!(f.node.state, State::Leader);

        let resp = l.on_vote_request(&mut f.node, vote("b", 2, 124)).await;
        assert_eq!(resp.ret_code, RetCode::Ok);
        assert_eq!(f.node.state, State::Follower);
        assert_eq!(f.node.view_id, 2);
    }

    #[tokio::test]
    async fn rival_heartbeat_only_wins_with_newer_view() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        let resp = l.on_heartbeat(&mut f.node, heartbeat("b", 1, 0)).await;
        assert_eq!(resp.ret_code, RetCode::InvalidViewId);
        assert_eq!(resp.leader.as_deref(), Some("a"));

        let resp = l.on_heartbeat(&mut f.node, heartbeat("b", 2, 0)).await;
        assert_eq!(resp.ret_code, RetCode::Ok);
        assert_eq!(f.node.state, State::Follower);
    }

    #[tokio::test]
    async fn purge_respects_skip_flag_and_runs_once_per_target() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        f.node.purge_target = Some("mysql-bin.000003".into());

        f.node.shared.skip_purge.store(true, Ordering::SeqCst);
        l.purge_binlogs(&mut f.node);
        f.node.wait_tasks().await;
        assert!(f.mysql.purged_to().is_none());

        f.node.shared.skip_purge.store(false, Ordering::SeqCst);
        l.purge_binlogs(&mut f.node);
        l.purge_binlogs(&mut f.node);
        f.node.wait_tasks().await;
        assert_eq!(f.mysql.purged_to().as_deref(), Some("mysql-bin.000003"));
        assert_eq!(f.node.shared.stats.snapshot().purges, 1);
    }

    #[tokio::test]
    async fn failed_purge_is_retried() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        f.node.purge_target = Some("mysql-bin.000004".into());

        f.mysql.set_alive(false);
        l.purge_binlogs(&mut f.node);
        f.node.wait_tasks().await;
        assert!(f.mysql.purged_to().is_none());
        assert_eq!(f.node.shared.stats.snapshot().purge_failures, 1);

        f.mysql.set_alive(true);
        l.purge_binlogs(&mut f.node);
        f.node.wait_tasks().await;
        assert_eq!(f.mysql.purged_to().as_deref(), Some("mysql-bin.000004"));
        assert_eq!(f.node.shared.stats.snapshot().purges, 1);
    }

    #[tokio::test]
    async fn heartbeat_tasks_do_not_accumulate() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        for _ in 0..200 {
            l.round.evaluated = true;
            l.send_heartbeats(&mut f.node).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(f.node.state, State::Leader);
        // At most the fan-out of the last round or two is still held.
        assert!(f.node.tasks.len() <= 6, "{} tasks retained", f.node.tasks.len());
    }

    #[tokio::test]
    async fn heartbeat_advertises_membership_with_leader() {
        let f = fixture(State::Leader);
        let mut peers = f.node.shared.advertised_peers();
        peers.sort();
        assert_eq!(peers, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn semi_sync_policy_depends_on_cluster_size() {
        let m = SimMySql::new("x");
        apply_semi_sync(&m, 2, 300_000).await.unwrap();
        assert_eq!(m.semi_sync(), (true, 1, 300_000));
        apply_semi_sync(&m, 5, 300_000).await.unwrap();
        assert_eq!(m.semi_sync(), (true, 2, SEMI_SYNC_INFINITE_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn promotion_makes_mysql_writable_master() {
        let f = fixture(State::Leader);
        promote(f.mysql.clone(), f.leader_command.clone(), "a".into())
            .await
            .unwrap();
        assert!(f.mysql.is_master());
        assert!(!f.mysql.is_read_only());
        assert_eq!(f.leader_command.starts(), 1);
    }

    #[tokio::test]
    async fn promotion_aborts_when_mysql_is_down() {
        let f = fixture(State::Leader);
        f.mysql.set_alive(false);
        assert!(promote(f.mysql.clone(), f.leader_command.clone(), "a".into())
            .await
            .is_err());
        assert_eq!(f.leader_command.starts(), 0);
    }

    #[tokio::test]
    async fn degrade_stops_vip_after_promotion_lands() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        l.on_enter(&mut f.node).await;
        f.node.set_state(State::Follower);
        l.on_exit(&mut f.node).await;
        assert_eq!(f.leader_command.starts(), 1);
        assert_eq!(f.leader_command.stops(), 1);
    }

    #[tokio::test]
    async fn degrade_before_promotion_skips_vip_stop() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        f.node.set_state(State::Follower);
        l.on_exit(&mut f.node).await;
        assert_eq!(f.leader_command.stops(), 0);
    }

    #[tokio::test]
    async fn failed_promotion_degrades_without_vip_stop() {
        let mut f = fixture(State::Leader);
        let mut l = leader(&mut f, 0);
        l.on_promotion_done(&mut f.node, Err(Error::MySql("boom".into())));
        assert_eq!(f.node.state, State::Follower);
        l.on_exit(&mut f.node).await;
        assert_eq!(f.leader_command.stops(), 0);
        assert_eq!(f.node.shared.stats.snapshot().degrades, 1);
    }
}
