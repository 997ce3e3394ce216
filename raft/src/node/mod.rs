//! The per-node state loop.
//!
//! One task owns a [`Node`] and runs the active state's handler until the
//! state changes, then dispatches to the next one. View, vote and leader
//! decisions are only ever made on this task, so they need no locking.

mod candidate;
mod follower;
mod leader;
mod passive;
mod replica;

use async_trait::async_trait;
use std::future::Future;
use std::sync::{atomic::Ordering, Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::{debug, info};

use crate::msg::{
    EpochId, HaCommand, HeartbeatRequest, HeartbeatResponse, NodeId, PingResponse,
    RequestVoteRequest, RequestVoteResponse, RetCode, State, Status, ViewId,
};
use crate::mysql::{Gtid, LeaderCommand, MySql};
use crate::stats::Stats;
use crate::{quorum, Shared};
use candidate::Candidate;
use follower::Follower;
use leader::Leader;
use passive::Passive;

/// An inbound request waiting for the state loop.
pub(crate) enum Event {
    Heartbeat(HeartbeatRequest, oneshot::Sender<HeartbeatResponse>),
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    Ping(oneshot::Sender<PingResponse>),
    Status(oneshot::Sender<Status>),
    Ha(HaCommand, oneshot::Sender<RetCode>),
}

/// Behavior of one state. The driver calls `on_enter`, then
/// `run_until_transition`, then `on_exit`; request handlers are invoked from
/// inside `run_until_transition` through [`dispatch`].
#[async_trait]
pub(crate) trait StateHandler: Send {
    fn state(&self) -> State;

    async fn on_enter(&mut self, node: &mut Node);

    /// Must not return before `node.state` differs from `self.state()`.
    async fn run_until_transition(&mut self, node: &mut Node);

    async fn on_exit(&mut self, node: &mut Node) {
        node.wait_tasks().await;
    }

    async fn on_heartbeat(&mut self, node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse;

    async fn on_vote_request(
        &mut self,
        node: &mut Node,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse;

    fn on_ping(&self, node: &Node) -> PingResponse {
        PingResponse {
            from: node.id().to_string(),
            state: node.state,
            ret_code: RetCode::Ok,
        }
    }
}

/// Loop-owned consensus state.
pub(crate) struct Node {
    pub shared: Arc<Shared>,
    pub events: mpsc::Receiver<Event>,
    pub state: State,
    pub view_id: ViewId,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    /// Set while repointing replication at the current leader keeps failing;
    /// blocks promotion.
    pub change_master_error: bool,
    /// Newest binlog every member has moved past.
    pub purge_target: Option<String>,
    tasks: JoinSet<()>,
}

impl Node {
    pub fn new(shared: Arc<Shared>, events: mpsc::Receiver<Event>, state: State) -> Self {
        Self {
            shared,
            events,
            state,
            view_id: 0,
            voted_for: None,
            leader: None,
            change_master_error: false,
            purge_target: None,
            tasks: JoinSet::new(),
        }
    }

    pub async fn run(mut self) {
        while self.state != State::Stopped {
            match self.state {
                State::Follower => self.drive(Follower::new()).await,
                State::Candidate => self.drive(Candidate::new()).await,
                State::Leader => {
                    let leader = Leader::new(&self.shared.config);
                    self.drive(leader).await
                }
                State::Idle | State::Invalid | State::Learner => {
                    let role = self.state;
                    self.drive(Passive::new(role)).await
                }
                State::Stopped => break,
            }
        }
        info!(id = %self.id(), view = self.view_id, "state loop stopped");
    }

    async fn drive<H: StateHandler>(&mut self, mut handler: H) {
        debug!(id = %self.id(), state = %handler.state(), "entering state");
        handler.on_enter(self).await;
        if self.state == handler.state() {
            handler.run_until_transition(self).await;
        }
        handler.on_exit(self).await;
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn mysql(&self) -> Arc<dyn MySql> {
        self.shared.mysql.clone()
    }

    pub fn leader_command(&self) -> Arc<dyn LeaderCommand> {
        self.shared.leader_command.clone()
    }

    pub fn members(&self) -> usize {
        self.shared.member_count()
    }

    pub fn quorum(&self) -> usize {
        quorum(self.members())
    }

    pub fn epoch_id(&self) -> EpochId {
        self.shared.epoch_id()
    }

    /// Every transition forgets the leader until one proves itself again.
    pub fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        info!(
            id = %self.id(),
            from = %self.state,
            to = %state,
            view = self.view_id,
            "state transition"
        );
        self.state = state;
        self.leader = None;
        self.shared.publish_state(state);
    }

    /// Moves the view forward, forgetting the vote of the previous view, and
    /// records the claimed leader.
    pub fn update_view(&mut self, view_id: ViewId, leader: Option<NodeId>) {
        if view_id > self.view_id {
            debug!(id = %self.id(), from = self.view_id, to = view_id, "view advanced");
            self.view_id = view_id;
            self.voted_for = None;
            self.shared.publish_view(view_id);
        }
        self.leader = leader;
    }

    /// Runs `task` in the background, first dropping tasks that already
    /// finished so a long tenure does not pile them up.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while self.tasks.try_join_next().is_some() {}
        self.tasks.spawn(task);
    }

    /// Waits for every task spawned during the current state's tenure.
    pub async fn wait_tasks(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    pub fn heartbeat_reply(&self, ret_code: RetCode) -> HeartbeatResponse {
        HeartbeatResponse {
            from: self.id().to_string(),
            view_id: self.view_id,
            epoch_id: self.epoch_id(),
            state: self.state,
            ret_code,
            leader: self.leader.clone(),
            relay_master_log_file: None,
        }
    }

    pub fn vote_reply(&self, ret_code: RetCode, gtid: Option<Gtid>) -> RequestVoteResponse {
        RequestVoteResponse {
            from: self.id().to_string(),
            view_id: self.view_id,
            epoch_id: self.epoch_id(),
            state: self.state,
            ret_code,
            gtid,
        }
    }

    pub fn status(&self) -> Status {
        let meta = self.shared.meta();
        Status {
            id: self.id().to_string(),
            state: self.state,
            view_id: self.view_id,
            epoch_id: self.epoch_id(),
            leader: self.leader.clone(),
            voted_for: self.voted_for.clone(),
            peers: meta.peers,
            idle_peers: meta.idle_peers,
            change_master_error: self.change_master_error,
            skip_purge_binlog: self.shared.skip_purge.load(Ordering::SeqCst),
            purge_target: self.purge_target.clone(),
            stats: self.shared.stats.snapshot(),
        }
    }

    async fn apply_ha(&mut self, command: HaCommand) -> RetCode {
        match command {
            HaCommand::Disable => self.set_state(State::Idle),
            HaCommand::SetLearner => self.set_state(State::Learner),
            HaCommand::SetInvalid => self.set_state(State::Invalid),
            HaCommand::Enable => {
                if self.state.is_passive() {
                    self.set_state(State::Follower);
                }
            }
            HaCommand::TryToLeader => {
                if self.state == State::Leader {
                    return RetCode::Ok;
                }
                if !self.shared.has_peers() || !self.shared.mysql.promotable().await {
                    info!(id = %self.id(), "refusing to lead: mysql not promotable");
                    return RetCode::MySqlUnpromotable;
                }
                self.set_state(State::Candidate);
            }
        }
        RetCode::Ok
    }
}

/// Answers one inbound event on behalf of the active handler.
pub(crate) async fn dispatch<H: StateHandler + ?Sized>(handler: &mut H, node: &mut Node, event: Event) {
    match event {
        Event::Heartbeat(req, tx) => {
            let resp = if node.shared.check_request(&req.from) {
                handler.on_heartbeat(node, req).await
            } else {
                debug!(id = %node.id(), from = %req.from, "heartbeat from unknown sender");
                node.heartbeat_reply(RetCode::InvalidRequest)
            };
            let _ = tx.send(resp);
        }
        Event::RequestVote(req, tx) => {
            let resp = if node.shared.check_request(&req.from) {
                let resp = handler.on_vote_request(node, req).await;
                if resp.ret_code == RetCode::Ok {
                    Stats::incr(&node.shared.stats.votes_granted);
                }
                resp
            } else {
                debug!(id = %node.id(), from = %req.from, "vote request from unknown sender");
                node.vote_reply(RetCode::InvalidRequest, None)
            };
            let _ = tx.send(resp);
        }
        Event::Ping(tx) => {
            let _ = tx.send(handler.on_ping(node));
        }
        Event::Status(tx) => {
            let _ = tx.send(node.status());
        }
        Event::Ha(command, tx) => {
            let _ = tx.send(node.apply_ha(command).await);
        }
    }
}
