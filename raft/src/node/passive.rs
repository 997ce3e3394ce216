use async_trait::async_trait;
use tracing::debug;

use super::{dispatch, replica, Node, StateHandler};
use crate::msg::{HeartbeatRequest, HeartbeatResponse, RequestVoteRequest, RequestVoteResponse, RetCode, State};

/// Idle, Invalid and Learner: replicate from whoever leads, never run for
/// election. Only an HA command moves a node out of these states.
pub(crate) struct Passive {
    role: State,
}

impl Passive {
    pub fn new(role: State) -> Self {
        debug_assert!(role.is_passive());
        Self { role }
    }
}

#[async_trait]
impl StateHandler for Passive {
    fn state(&self) -> State {
        self.role
    }

    async fn on_enter(&mut self, node: &mut Node) {
        replica::enter(node);
    }

    async fn run_until_transition(&mut self, node: &mut Node) {
        let stop = node.shared.stop.clone();
        while node.state == self.role {
            tokio::select! {
                _ = stop.cancelled() => node.set_state(State::Stopped),
                Some(event) = node.events.recv() => dispatch(self, node, event).await,
            }
        }
    }

    async fn on_heartbeat(&mut self, node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse {
        replica::on_heartbeat(node, req).await
    }

    /// An Idle node acknowledges without committing to anything, so the
    /// candidate can drop it from the count. Invalid and Learner refuse.
    async fn on_vote_request(
        &mut self,
        node: &mut Node,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let code = match self.role {
            State::Idle => RetCode::Ok,
            State::Invalid => RetCode::InvalidRequest,
            _ => RetCode::VoteNotGranted,
        };
        debug!(id = %node.id(), role = %self.role, candidate = %req.from, %code, "passive vote");
        node.vote_reply(code, None)
    }
}
