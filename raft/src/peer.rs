use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, time};
use tracing::debug;

use crate::error::{Error, Result};
use crate::msg::{
    HeartbeatRequest, HeartbeatResponse, NodeId, PingResponse, Request, RequestVoteRequest,
    RequestVoteResponse, Response, RetCode, State,
};
use crate::transport::Transport;

/// Proxy for a remote cluster member.
///
/// Every `send_*` pushes exactly one response onto the given channel, a
/// synthetic `ErrorRPCCall` one when the call fails or exceeds its deadline,
/// so a round collector can count on one answer per peer.
#[derive(Clone)]
pub struct Peer {
    addr: NodeId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Peer {
    pub fn new(addr: NodeId, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            addr,
            transport,
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Races the call against the peer deadline. The losing call future is
    /// dropped, which closes its connection.
    async fn call_timeout(&self, request: Request) -> Result<Response> {
        match time::timeout(self.timeout, self.transport.call(&self.addr, request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn send_heartbeat(
        self,
        req: HeartbeatRequest,
        tx: mpsc::UnboundedSender<HeartbeatResponse>,
    ) {
        let resp = match self.call_timeout(Request::Heartbeat(req)).await {
            Ok(Response::Heartbeat(resp)) => resp,
            Ok(other) => self.heartbeat_error(Error::Rpc(format!("unexpected {other:?}"))),
            Err(e) => self.heartbeat_error(e),
        };
        let _ = tx.send(resp);
    }

    pub async fn send_request_vote(
        self,
        req: RequestVoteRequest,
        tx: mpsc::UnboundedSender<RequestVoteResponse>,
    ) {
        let resp = match self.call_timeout(Request::RequestVote(req)).await {
            Ok(Response::RequestVote(resp)) => resp,
            Ok(other) => self.vote_error(Error::Rpc(format!("unexpected {other:?}"))),
            Err(e) => self.vote_error(e),
        };
        let _ = tx.send(resp);
    }

    pub async fn send_ping(self, tx: mpsc::UnboundedSender<PingResponse>) {
        let resp = match self.call_timeout(Request::Ping).await {
            Ok(Response::Ping(resp)) => resp,
            Ok(_) | Err(_) => PingResponse {
                from: self.addr.clone(),
                state: State::Stopped,
                ret_code: RetCode::RpcCall,
            },
        };
        let _ = tx.send(resp);
    }

    fn heartbeat_error(&self, e: Error) -> HeartbeatResponse {
        debug!(peer = %self.addr, error = %e, "heartbeat call failed");
        HeartbeatResponse {
            from: self.addr.clone(),
            view_id: 0,
            epoch_id: 0,
            state: State::Stopped,
            ret_code: RetCode::RpcCall,
            leader: None,
            relay_master_log_file: None,
        }
    }

    fn vote_error(&self, e: Error) -> RequestVoteResponse {
        debug!(peer = %self.addr, error = %e, "request vote call failed");
        RequestVoteResponse {
            from: self.addr.clone(),
            view_id: 0,
            epoch_id: 0,
            state: State::Stopped,
            ret_code: RetCode::RpcCall,
            gtid: None,
        }
    }
}
