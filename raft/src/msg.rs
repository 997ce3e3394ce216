use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::mysql::{Gtid, Repl};
use crate::stats::StatsSnapshot;

/// Stable connection string of a cluster member, e.g. `10.0.0.1:6000`.
pub type NodeId = String;
/// Leadership epoch, analogous to a Raft term.
pub type ViewId = u64;
/// Membership version, bumped on every peer set change.
pub type EpochId = u64;

/// Ceiling for handing an inbound request to the state loop.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);
/// Ceiling for the state loop to answer a delivered request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
    Idle,
    Invalid,
    Learner,
    Stopped,
}

impl State {
    /// Roles that never start an election on their own.
    pub fn is_passive(self) -> bool {
        matches!(self, State::Idle | State::Invalid | State::Learner)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            State::Follower => 0,
            State::Candidate => 1,
            State::Leader => 2,
            State::Idle => 3,
            State::Invalid => 4,
            State::Learner => 5,
            State::Stopped => 6,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Follower,
            1 => State::Candidate,
            2 => State::Leader,
            3 => State::Idle,
            4 => State::Invalid,
            5 => State::Learner,
            _ => State::Stopped,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response codes carried in every protocol answer. These are outcomes, not
/// faults: every request that can be answered is answered with one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ErrorInvalidRequest")]
    InvalidRequest,
    #[serde(rename = "ErrorInvalidViewID")]
    InvalidViewId,
    #[serde(rename = "ErrorInvalidGTID")]
    InvalidGtid,
    #[serde(rename = "ErrorVoteNotGranted")]
    VoteNotGranted,
    #[serde(rename = "ErrorMySQLDown")]
    MySqlDown,
    #[serde(rename = "ErrorChangeMaster")]
    ChangeMaster,
    #[serde(rename = "ErrorRPCCall")]
    RpcCall,
    #[serde(rename = "RPCError_MySQLUnpromotable")]
    MySqlUnpromotable,
}

impl RetCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetCode::Ok => "OK",
            RetCode::InvalidRequest => "ErrorInvalidRequest",
            RetCode::InvalidViewId => "ErrorInvalidViewID",
            RetCode::InvalidGtid => "ErrorInvalidGTID",
            RetCode::VoteNotGranted => "ErrorVoteNotGranted",
            RetCode::MySqlDown => "ErrorMySQLDown",
            RetCode::ChangeMaster => "ErrorChangeMaster",
            RetCode::RpcCall => "ErrorRPCCall",
            RetCode::MySqlUnpromotable => "RPCError_MySQLUnpromotable",
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent by the Leader to every peer and idle peer once per heartbeat round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub view_id: ViewId,
    pub epoch_id: EpochId,
    pub from: NodeId,
    pub to: NodeId,
    pub leader: NodeId,
    pub peers: Vec<NodeId>,
    pub idle_peers: Vec<NodeId>,
    /// Replication coordinates followers point `CHANGE MASTER TO` at.
    pub repl: Repl,
    pub gtid: Gtid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub from: NodeId,
    pub view_id: ViewId,
    pub epoch_id: EpochId,
    pub state: State,
    pub ret_code: RetCode,
    /// Leader known to the responder; set when rejecting a stale view.
    pub leader: Option<NodeId>,
    /// Oldest master binlog the responder still needs.
    pub relay_master_log_file: Option<String>,
}

/// Sent by a Candidate to every peer at the start of an election round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub view_id: ViewId,
    pub epoch_id: EpochId,
    pub from: NodeId,
    pub to: NodeId,
    pub leader: Option<NodeId>,
    pub gtid: Gtid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub from: NodeId,
    pub view_id: ViewId,
    pub epoch_id: EpochId,
    pub state: State,
    pub ret_code: RetCode,
    pub gtid: Option<Gtid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub from: NodeId,
    pub state: State,
    pub ret_code: RetCode,
}

/// Administrative state overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaCommand {
    Disable,
    Enable,
    SetLearner,
    SetInvalid,
    TryToLeader,
}

/// Read-only introspection of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub state: State,
    pub view_id: ViewId,
    pub epoch_id: EpochId,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub peers: Vec<NodeId>,
    pub idle_peers: Vec<NodeId>,
    pub change_master_error: bool,
    pub skip_purge_binlog: bool,
    pub purge_target: Option<String>,
    pub stats: StatsSnapshot,
}

/// A decoded inbound RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Heartbeat(HeartbeatRequest),
    RequestVote(RequestVoteRequest),
    Ping,
    Status,
    EnablePurgeBinlog,
    DisablePurgeBinlog,
    Ha { from: NodeId, command: HaCommand },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Heartbeat(HeartbeatResponse),
    RequestVote(RequestVoteResponse),
    Ping(PingResponse),
    Status(Box<Status>),
    Done,
    Ha(RetCode),
}
