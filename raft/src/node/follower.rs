use async_trait::async_trait;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{dispatch, replica, Node, StateHandler};
use crate::msg::{HeartbeatRequest, HeartbeatResponse, RequestVoteRequest, RequestVoteResponse, RetCode, State};

/// Passive voting member. Becomes Candidate when the leader goes quiet for an
/// election timeout and local MySQL is promotable.
pub(crate) struct Follower {
    deadline: Instant,
    brain_split_check: Option<Interval>,
    /// Whether a current leader was heard since the last brain-split check.
    heard_leader: bool,
}

impl Follower {
    pub fn new() -> Self {
        Self {
            deadline: Instant::now(),
            brain_split_check: None,
            heard_leader: false,
        }
    }

    fn reset_timeout(&mut self, node: &Node) {
        self.deadline = Instant::now() + node.shared.config.random_election_timeout();
    }

    async fn on_election_timeout(&mut self, node: &mut Node) {
        self.reset_timeout(node);
        if !node.shared.has_peers() {
            debug!(id = %node.id(), "no configured peers, not promoting");
            return;
        }
        if node.change_master_error {
            warn!(id = %node.id(), "change master pending, not promoting");
            return;
        }
        if !node.mysql().promotable().await {
            debug!(id = %node.id(), "mysql not promotable, not promoting");
            return;
        }
        info!(id = %node.id(), view = node.view_id, "election timeout");
        node.set_state(State::Candidate);
    }

    /// Without a leader for a whole window, re-asserts replica posture so a
    /// former Leader that missed its own demotion stops taking writes.
    fn check_brain_split(&mut self, node: &mut Node) {
        if std::mem::take(&mut self.heard_leader) {
            return;
        }
        debug!(id = %node.id(), "no leader heard, re-asserting replica posture");
        let mysql = node.mysql();
        let leader_command = node.leader_command();
        let id = node.id().to_string();
        node.spawn(async move {
            if let Err(e) = leader_command.run_leader_stop_command().await {
                warn!(%id, error = %e, "leader stop command failed");
            }
            if let Err(e) = mysql.set_read_only().await {
                warn!(%id, error = %e, "failed to set read only");
            }
        });
    }
}

#[async_trait]
impl StateHandler for Follower {
    fn state(&self) -> State {
        State::Follower
    }

    async fn on_enter(&mut self, node: &mut Node) {
        replica::enter(node);
        self.reset_timeout(node);
        let period = node.shared.config.brain_split_check_interval;
        let mut check = time::interval_at(Instant::now() + period, period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.brain_split_check = Some(check);
    }

    async fn run_until_transition(&mut self, node: &mut Node) {
        let stop = node.shared.stop.clone();
        let Some(mut check) = self.brain_split_check.take() else {
            return;
        };
        while node.state == State::Follower {
            tokio::select! {
                _ = stop.cancelled() => node.set_state(State::Stopped),
                Some(event) = node.events.recv() => dispatch(self, node, event).await,
                _ = time::sleep_until(self.deadline) => self.on_election_timeout(node).await,
                _ = check.tick() => self.check_brain_split(node),
            }
        }
    }

    async fn on_heartbeat(&mut self, node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse {
        let resp = replica::on_heartbeat(node, req).await;
        if resp.ret_code != RetCode::InvalidViewId {
            self.reset_timeout(node);
            self.heard_leader = true;
        }
        resp
    }

    async fn on_vote_request(
        &mut self,
        node: &mut Node,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let resp = replica::on_vote_request(node, req).await;
        if resp.ret_code == RetCode::Ok {
            self.reset_timeout(node);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, heartbeat, vote};
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn promotes_on_timeout_when_promotable() {
        let mut f = fixture(State::Follower);
        let mut h = Follower::new();
        h.on_election_timeout(&mut f.node).await;
        assert_eq!(f.node.state, State::Candidate);
    }

    #[tokio::test]
    async fn no_configured_peers_blocks_promotion() {
        let mut f = fixture(State::Follower);
        f.node.shared.update_epoch(9, vec!["a".into()], vec![]);
        let mut h = Follower::new();
        h.on_election_timeout(&mut f.node).await;
        assert_eq!(f.node.state, State::Follower);
    }

    #[tokio::test]
    async fn change_master_error_blocks_promotion() {
        let mut f = fixture(State::Follower);
        f.node.change_master_error = true;
        let mut h = Follower::new();
        h.on_election_timeout(&mut f.node).await;
        assert_eq!(f.node.state, State::Follower);
    }

    #[tokio::test]
    async fn unpromotable_mysql_blocks_promotion() {
        let mut f = fixture(State::Follower);
        f.mysql.set_sql_running(false);
        let mut h = Follower::new();
        h.on_election_timeout(&mut f.node).await;
        assert_eq!(f.node.state, State::Follower);
    }

    #[tokio::test]
    async fn valid_heartbeat_pushes_deadline() {
        let mut f = fixture(State::Follower);
        let mut h = Follower::new();
        let before = h.deadline;
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.on_heartbeat(&mut f.node, heartbeat("b", 1, 0)).await;
        assert!(h.deadline > before + Duration::from_millis(100));
        assert!(h.heard_leader);

        let before = h.deadline;
        f.node.update_view(9, None);
        h.on_heartbeat(&mut f.node, heartbeat("b", 1, 0)).await;
        assert_eq!(h.deadline, before);
    }

    #[tokio::test]
    async fn brain_split_check_reasserts_read_only_when_leaderless() {
        let mut f = fixture(State::Follower);
        let mut h = Follower::new();
        h.heard_leader = true;
        h.check_brain_split(&mut f.node);
        f.node.wait_tasks().await;
        assert_eq!(f.leader_command.stops(), 0);

        h.check_brain_split(&mut f.node);
        f.node.wait_tasks().await;
        assert_eq!(f.leader_command.stops(), 1);
        assert!(f.mysql.calls().contains(&"set_read_only"));
    }

    #[tokio::test]
    async fn granted_vote_resets_timer() {
        let mut f = fixture(State::Follower);
        let mut h = Follower::new();
        let before = h.deadline;
        let resp = h.on_vote_request(&mut f.node, vote("b", 1, 4)).await;
        assert_eq!(resp.ret_code, RetCode::Ok);
        assert!(h.deadline > before);
    }
}
