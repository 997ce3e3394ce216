use ahash::{HashSet, HashSetExt};
use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    time::{self, Instant, Interval},
};
use tracing::{debug, info, warn};

use super::{dispatch, replica, Node, StateHandler};
use crate::msg::{
    HeartbeatRequest, HeartbeatResponse, NodeId, RequestVoteRequest, RequestVoteResponse, RetCode,
    State,
};
use crate::quorum;
use crate::stats::Stats;

/// Runs election rounds until it wins, hears from a live leader, or learns it
/// is stale.
pub(crate) struct Candidate {
    deadline: Instant,
    vote_check: Option<Interval>,
    votes_rx: Option<mpsc::UnboundedReceiver<RequestVoteResponse>>,
    /// Self vote included.
    granted: usize,
    /// Members that answered OK while Idle; they leave the denominator.
    idle_voted: usize,
    voters: HashSet<NodeId>,
}

impl Candidate {
    pub fn new() -> Self {
        Self {
            deadline: Instant::now(),
            vote_check: None,
            votes_rx: None,
            granted: 0,
            idle_voted: 0,
            voters: HashSet::new(),
        }
    }

    /// Bumps the view, votes for itself and solicits every peer.
    async fn start_round(&mut self, node: &mut Node) {
        let gtid = match node.mysql().gtid().await {
            Ok(gtid) => gtid,
            Err(e) => {
                warn!(id = %node.id(), error = %e, "cannot read gtid, abandoning election");
                node.set_state(State::Follower);
                return;
            }
        };
        node.update_view(node.view_id + 1, None);
        node.voted_for = Some(node.id().to_string());
        Stats::incr(&node.shared.stats.elections);
        info!(
            id = %node.id(),
            view = node.view_id,
            members = node.members(),
            "starting election"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        self.votes_rx = Some(rx);
        self.granted = 1;
        self.idle_voted = 0;
        self.voters.clear();
        let epoch_id = node.epoch_id();
        for peer in node.shared.peers() {
            let req = RequestVoteRequest {
                view_id: node.view_id,
                epoch_id,
                from: node.id().to_string(),
                to: peer.addr().to_string(),
                leader: None,
                gtid: gtid.clone(),
            };
            node.spawn(peer.send_request_vote(req, tx.clone()));
        }

        self.deadline = Instant::now() + node.shared.config.random_election_timeout();
        let period = node.shared.config.vote_check_interval();
        self.vote_check = Some(time::interval_at(Instant::now() + period, period));
        self.check_unanimous(node);
    }

    fn voting_members(&self, node: &Node) -> usize {
        node.members().saturating_sub(self.idle_voted)
    }

    fn check_unanimous(&mut self, node: &mut Node) {
        if self.granted >= self.voting_members(node) {
            self.promote(node);
        }
    }

    fn check_quorum(&mut self, node: &mut Node) {
        let needed = quorum(self.voting_members(node));
        debug!(
            id = %node.id(),
            view = node.view_id,
            granted = self.granted,
            idle_voted = self.idle_voted,
            needed,
            "vote check"
        );
        if self.granted >= needed {
            self.promote(node);
        }
    }

    fn promote(&mut self, node: &mut Node) {
        info!(
            id = %node.id(),
            view = node.view_id,
            granted = self.granted,
            members = node.members(),
            "won election"
        );
        node.set_state(State::Leader);
    }

    fn on_vote_response(&mut self, node: &mut Node, resp: RequestVoteResponse) {
        if !self.voters.insert(resp.from.clone()) {
            return;
        }
        match resp.ret_code {
            RetCode::Ok if resp.state == State::Idle => self.idle_voted += 1,
            RetCode::Ok => self.granted += 1,
            RetCode::InvalidViewId | RetCode::InvalidGtid => {
                info!(
                    id = %node.id(),
                    from = %resp.from,
                    code = %resp.ret_code,
                    view = resp.view_id,
                    "election rejected, degrading"
                );
                node.update_view(resp.view_id, None);
                node.set_state(State::Follower);
                return;
            }
            // A lone broken peer must not deadlock a tiny cluster.
            RetCode::MySqlDown if node.members() < 3 => self.granted += 1,
            code => debug!(id = %node.id(), from = %resp.from, %code, "vote not granted"),
        }
        self.check_unanimous(node);
    }
}

#[async_trait]
impl StateHandler for Candidate {
    fn state(&self) -> State {
        State::Candidate
    }

    async fn on_enter(&mut self, node: &mut Node) {
        self.start_round(node).await;
    }

    async fn run_until_transition(&mut self, node: &mut Node) {
        let stop = node.shared.stop.clone();
        while node.state == State::Candidate {
            let (Some(votes_rx), Some(vote_check)) = (self.votes_rx.as_mut(), self.vote_check.as_mut())
            else {
                return;
            };
            tokio::select! {
                _ = stop.cancelled() => node.set_state(State::Stopped),
                Some(event) = node.events.recv() => dispatch(self, node, event).await,
                Some(resp) = votes_rx.recv() => self.on_vote_response(node, resp),
                _ = vote_check.tick() => self.check_quorum(node),
                _ = time::sleep_until(self.deadline) => {
                    info!(id = %node.id(), view = node.view_id, "election timed out");
                    self.start_round(node).await;
                }
            }
        }
    }

    /// A valid heartbeat means a live leader exists: follow it.
    async fn on_heartbeat(&mut self, node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse {
        if req.view_id < node.view_id {
            return node.heartbeat_reply(RetCode::InvalidViewId);
        }
        info!(id = %node.id(), leader = %req.from, view = req.view_id, "heard leader, degrading");
        node.set_state(State::Follower);
        replica::on_heartbeat(node, req).await
    }

    async fn on_vote_request(
        &mut self,
        node: &mut Node,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let resp = replica::on_vote_request(node, req).await;
        if resp.ret_code == RetCode::Ok {
            node.set_state(State::Follower);
        }
        resp
    }
}
