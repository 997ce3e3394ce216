//! Replica-side behavior shared by every non-leader role.

use tracing::{debug, info, warn};

use super::Node;
use crate::msg::{HeartbeatRequest, HeartbeatResponse, RequestVoteRequest, RequestVoteResponse, RetCode};
use crate::stats::Stats;

/// Detaches the VIP and puts MySQL into replica posture in the background,
/// so heartbeats are answered while it runs.
pub(super) fn enter(node: &mut Node) {
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
        if let Err(e) = mysql.set_slave_global_sys_var().await {
            warn!(%id, error = %e, "failed to apply replica system variables");
        }
    });
}

/// Follows the sender of a current heartbeat: replica posture, replication
/// pointed at the sender, then view and membership catch-up.
pub(super) async fn on_heartbeat(node: &mut Node, req: HeartbeatRequest) -> HeartbeatResponse {
    if req.view_id < node.view_id {
        debug!(
            id = %node.id(),
            from = %req.from,
            view = req.view_id,
            local_view = node.view_id,
            "rejecting heartbeat from stale view"
        );
        return node.heartbeat_reply(RetCode::InvalidViewId);
    }

    let mysql = node.mysql();
    if let Err(e) = mysql.disable_semi_sync_master().await {
        warn!(id = %node.id(), error = %e, "failed to disable semi-sync master");
    }
    if let Err(e) = mysql.set_read_only().await {
        warn!(id = %node.id(), error = %e, "failed to set read only");
    }
    if let Err(e) = mysql.start_slave().await {
        warn!(id = %node.id(), error = %e, "failed to start replication");
    }

    if node.leader.as_deref() != Some(req.from.as_str()) {
        if let Err(e) = mysql.change_master_to(&req.repl).await {
            warn!(id = %node.id(), leader = %req.from, error = %e, "change master failed");
            if !node.change_master_error {
                Stats::incr(&node.shared.stats.change_master_errors);
            }
            node.change_master_error = true;
            return node.heartbeat_reply(RetCode::ChangeMaster);
        }
        info!(id = %node.id(), leader = %req.from, view = req.view_id, "following new leader");
        node.change_master_error = false;
    }

    node.update_view(req.view_id, Some(req.from.clone()));
    if req.epoch_id > node.epoch_id() {
        node.shared
            .update_epoch(req.epoch_id, req.peers, req.idle_peers);
    }

    let mut resp = node.heartbeat_reply(RetCode::Ok);
    resp.relay_master_log_file = mysql.relay_master_log_file().await;
    resp
}

/// Votes the way a Follower does: never for a stale view, never for a
/// requester behind our own promotable data, and once per view.
pub(super) async fn on_vote_request(
    node: &mut Node,
    req: RequestVoteRequest,
) -> RequestVoteResponse {
    if req.view_id < node.view_id {
        debug!(id = %node.id(), from = %req.from, view = req.view_id, "rejecting vote for stale view");
        return node.vote_reply(RetCode::InvalidViewId, None);
    }

    let mysql = node.mysql();
    let (ahead, local) = match mysql.gtid_greater_than(&req.gtid).await {
        Ok(r) => r,
        Err(e) => {
            warn!(id = %node.id(), error = %e, "cannot read local gtid for vote");
            return node.vote_reply(RetCode::MySqlDown, None);
        }
    };
    if ahead && mysql.promotable().await {
        debug!(id = %node.id(), from = %req.from, "rejecting vote: local data is ahead");
        return node.vote_reply(RetCode::InvalidGtid, Some(local));
    }

    if req.view_id > node.view_id {
        node.update_view(req.view_id, None);
    } else if matches!(&node.voted_for, Some(v) if *v != req.from) {
        debug!(
            id = %node.id(),
            from = %req.from,
            voted_for = ?node.voted_for,
            "already voted in this view"
        );
        return node.vote_reply(RetCode::VoteNotGranted, Some(local));
    }

    info!(id = %node.id(), candidate = %req.from, view = req.view_id, "granting vote");
    node.voted_for = Some(req.from);
    node.vote_reply(RetCode::Ok, Some(local))
}
