use ahash::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod error;
pub mod meta;
pub mod msg;
pub mod mysql;
mod node;
pub mod peer;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

use meta::{Meta, MetaStore};
use msg::{
    EpochId, HaCommand, HeartbeatRequest, HeartbeatResponse, NodeId, PingResponse, Request,
    RequestVoteRequest, RequestVoteResponse, Response, RetCode, State, Status, ViewId,
    RESPONSE_TIMEOUT, SEND_TIMEOUT,
};
use mysql::{LeaderCommand, MySql};
use node::{Event, Node};
use peer::Peer;
use stats::Stats;
use transport::Transport;

/// Majority of `members` voting members.
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Runtime mirror of [`Meta`]: the persisted sets plus a [`Peer`] per remote
/// member. Neither `meta` nor the peer maps ever hold the local id.
#[derive(Debug, Default)]
pub(crate) struct Members {
    pub epoch_id: EpochId,
    pub meta: Meta,
    pub peers: HashMap<NodeId, Peer>,
    pub idle_peers: HashMap<NodeId, Peer>,
}

/// State shared between the public handle and the state loop.
pub(crate) struct Shared {
    pub id: NodeId,
    pub config: Config,
    pub mysql: Arc<dyn MySql>,
    pub leader_command: Arc<dyn LeaderCommand>,
    transport: Arc<dyn Transport>,
    store: MetaStore,
    pub members: RwLock<Members>,
    /// Observability mirrors; protocol decisions use the loop's own copies.
    state: AtomicU8,
    view_id: AtomicU64,
    pub skip_purge: AtomicBool,
    pub stats: Stats,
    pub stop: CancellationToken,
    event_tx: mpsc::Sender<Event>,
}

impl Shared {
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn publish_state(&self, state: State) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn publish_view(&self, view_id: ViewId) {
        self.view_id.store(view_id, Ordering::SeqCst);
    }

    /// Number of voting members, self included. Idle peers never count.
    pub fn member_count(&self) -> usize {
        self.members.read().peers.len() + 1
    }

    pub fn has_peers(&self) -> bool {
        !self.members.read().peers.is_empty()
    }

    pub fn epoch_id(&self) -> EpochId {
        self.members.read().epoch_id
    }

    pub fn meta(&self) -> Meta {
        self.members.read().meta.clone()
    }

    pub fn is_peer(&self, id: &str) -> bool {
        self.members.read().peers.contains_key(id)
    }

    /// Whether `from` is a currently known member. Requests from anyone else
    /// are rejected so that two clusters with briefly overlapping peer lists
    /// cannot influence each other.
    pub fn check_request(&self, from: &str) -> bool {
        let m = self.members.read();
        m.peers.contains_key(from) || m.idle_peers.contains_key(from)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.members.read().peers.values().cloned().collect()
    }

    /// Peers and idle peers, each endpoint once.
    pub fn heartbeat_targets(&self) -> Vec<Peer> {
        let m = self.members.read();
        let mut targets: Vec<Peer> = m.peers.values().cloned().collect();
        for (id, peer) in &m.idle_peers {
            if !m.peers.contains_key(id) {
                targets.push(peer.clone());
            }
        }
        targets
    }

    fn reconcile(&self, m: &mut Members) {
        let Members {
            meta,
            peers,
            idle_peers,
            ..
        } = m;
        Self::reconcile_map(&self.id, &meta.peers, peers, &self.transport, &self.config);
        Self::reconcile_map(&self.id, &meta.idle_peers, idle_peers, &self.transport, &self.config);
    }

    fn reconcile_map(
        local: &str,
        wanted: &[NodeId],
        map: &mut HashMap<NodeId, Peer>,
        transport: &Arc<dyn Transport>,
        config: &Config,
    ) {
        map.retain(|id, _| wanted.contains(id));
        for id in wanted {
            if id != local && !map.contains_key(id) {
                map.insert(
                    id.clone(),
                    Peer::new(id.clone(), transport.clone(), config.rpc_timeout),
                );
            }
        }
    }

    /// Applies `f` to the membership under the write lock; if it changed
    /// anything, bumps the epoch, rebuilds the peer maps and persists.
    fn mutate(&self, f: impl FnOnce(&mut Meta) -> bool) -> Result<()> {
        let mut m = self.members.write();
        if !f(&mut m.meta) {
            return Ok(());
        }
        m.epoch_id += 1;
        self.reconcile(&mut m);
        info!(
            id = %self.id,
            epoch = m.epoch_id,
            peers = ?m.meta.peers,
            idle_peers = ?m.meta.idle_peers,
            "membership changed"
        );
        self.store.write(&m.meta)
    }

    /// Voting membership as broadcast by a Leader: its own peers plus itself.
    pub fn advertised_peers(&self) -> Vec<NodeId> {
        let mut peers = self.members.read().meta.peers.clone();
        peers.push(self.id.clone());
        peers
    }

    /// Converges on a membership learned from the Leader.
    pub fn update_epoch(
        &self,
        epoch_id: EpochId,
        mut peers: Vec<NodeId>,
        mut idle_peers: Vec<NodeId>,
    ) {
        peers.retain(|p| *p != self.id);
        idle_peers.retain(|p| *p != self.id);
        let mut m = self.members.write();
        m.meta = Meta { peers, idle_peers };
        m.epoch_id = epoch_id;
        self.reconcile(&mut m);
        info!(id = %self.id, epoch = epoch_id, peers = ?m.meta.peers, "adopted membership");
        if let Err(e) = self.store.write(&m.meta) {
            error!(id = %self.id, error = %e, "failed to persist membership");
        }
    }
}

/// Handle to one cluster member's election engine.
///
/// Inbound RPCs are turned into events and answered by the state loop;
/// membership changes are applied directly under the membership lock.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
    events: Arc<Mutex<Option<mpsc::Receiver<Event>>>>,
    handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Raft {
    /// Recovers membership from the meta file. Failing to create the meta
    /// directory or to read an existing file is fatal.
    pub fn new(
        id: impl Into<NodeId>,
        config: Config,
        mysql: Arc<dyn MySql>,
        leader_command: Arc<dyn LeaderCommand>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let store = MetaStore::open(config.meta_path())?;
        let mut meta = store.read()?;
        meta.remove_peer(&id);
        meta.remove_idle_peer(&id);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let shared = Arc::new(Shared {
            id,
            config,
            mysql,
            leader_command,
            transport,
            store,
            members: RwLock::new(Members::default()),
            state: AtomicU8::new(State::Stopped.as_u8()),
            view_id: AtomicU64::new(0),
            skip_purge: AtomicBool::new(false),
            stats: Stats::default(),
            stop: CancellationToken::new(),
            event_tx,
        });
        {
            let mut m = shared.members.write();
            m.meta = meta;
            shared.reconcile(&mut m);
            info!(id = %shared.id, peers = ?m.meta.peers, "recovered membership");
        }
        Ok(Self {
            shared,
            events: Arc::new(Mutex::new(Some(event_rx))),
            handle: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn epoch_id(&self) -> EpochId {
        self.shared.epoch_id()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.shared.meta().peers
    }

    pub fn idle_peers(&self) -> Vec<NodeId> {
        self.shared.meta().idle_peers
    }

    /// Spawns the state loop, beginning in Idle for super-idle nodes and in
    /// Follower otherwise. Starting twice is a no-op; a stopped node cannot
    /// be restarted.
    pub async fn start(&self) -> Result<()> {
        if self.shared.stop.is_cancelled() {
            return Err(Error::Stop);
        }
        let Some(events) = self.events.lock().take() else {
            return Ok(());
        };
        let state = if self.shared.config.super_idle {
            State::Idle
        } else {
            State::Follower
        };
        info!(id = %self.shared.id, %state, "starting");
        self.shared.publish_state(state);
        let node = Node::new(self.shared.clone(), events, state);
        *self.handle.lock().await = Some(tokio::spawn(node.run()));
        Ok(())
    }

    /// Moves to Stopped and waits for the state loop and its tasks to finish.
    pub async fn stop(&self) {
        self.shared.stop.cancel();
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            if let Err(e) = h.await {
                error!(id = %self.shared.id, error = %e, "state loop panicked");
            }
        }
        self.shared.publish_state(State::Stopped);
    }

    /// Hands an event to the state loop and waits for its answer, both under
    /// fixed ceilings so a wedged loop cannot hold the caller forever.
    async fn send<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        if self.shared.stop.is_cancelled() || self.shared.state() == State::Stopped {
            return Err(Error::Stop);
        }
        let (tx, rx) = oneshot::channel();
        match self.shared.event_tx.send_timeout(make(tx), SEND_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => return Err(Error::Send),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => return Err(Error::Stop),
        }
        match time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::Stop),
            Err(_) => Err(Error::Send),
        }
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.send(|tx| Event::Heartbeat(req, tx)).await
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.send(|tx| Event::RequestVote(req, tx)).await
    }

    pub async fn ping(&self) -> Result<PingResponse> {
        self.send(Event::Ping).await
    }

    /// Introspection. Answers from the published mirrors once stopped.
    pub async fn status(&self) -> Status {
        match self.send(Event::Status).await {
            Ok(status) => status,
            Err(_) => {
                let meta = self.shared.meta();
                Status {
                    id: self.shared.id.clone(),
                    state: self.shared.state(),
                    view_id: self.shared.view_id.load(Ordering::SeqCst),
                    epoch_id: self.shared.epoch_id(),
                    leader: None,
                    voted_for: None,
                    peers: meta.peers,
                    idle_peers: meta.idle_peers,
                    change_master_error: false,
                    skip_purge_binlog: self.shared.skip_purge.load(Ordering::SeqCst),
                    purge_target: None,
                    stats: self.shared.stats.snapshot(),
                }
            }
        }
    }

    pub fn enable_purge_binlog(&self) {
        info!(id = %self.shared.id, "binlog purge enabled");
        self.shared.skip_purge.store(false, Ordering::SeqCst);
    }

    pub fn disable_purge_binlog(&self) {
        info!(id = %self.shared.id, "binlog purge disabled");
        self.shared.skip_purge.store(true, Ordering::SeqCst);
    }

    /// Administrative state override.
    pub async fn ha(&self, from: &str, command: HaCommand) -> Result<RetCode> {
        info!(id = %self.shared.id, %from, ?command, "ha request");
        self.send(|tx| Event::Ha(command, tx)).await
    }

    /// Routes a decoded wire request to the matching operation.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::Heartbeat(req) => Response::Heartbeat(self.heartbeat(req).await?),
            Request::RequestVote(req) => Response::RequestVote(self.request_vote(req).await?),
            Request::Ping => Response::Ping(self.ping().await?),
            Request::Status => Response::Status(Box::new(self.status().await)),
            Request::EnablePurgeBinlog => {
                self.enable_purge_binlog();
                Response::Done
            }
            Request::DisablePurgeBinlog => {
                self.disable_purge_binlog();
                Response::Done
            }
            Request::Ha { from, command } => Response::Ha(self.ha(&from, command).await?),
        })
    }

    /// Adds a voting member. The local id and duplicates are no-ops.
    pub fn add_peer(&self, id: &str) -> Result<()> {
        if id == self.shared.id {
            return Ok(());
        }
        self.shared.mutate(|meta| meta.add_peer(id))
    }

    pub fn remove_peer(&self, id: &str) -> Result<()> {
        if id == self.shared.id {
            warn!(id = %self.shared.id, "refusing to remove self from peers");
            return Ok(());
        }
        self.shared.mutate(|meta| meta.remove_peer(id))
    }

    pub fn add_idle_peer(&self, id: &str) -> Result<()> {
        if id == self.shared.id {
            return Ok(());
        }
        self.shared.mutate(|meta| meta.add_idle_peer(id))
    }

    pub fn remove_idle_peer(&self, id: &str) -> Result<()> {
        self.shared.mutate(|meta| meta.remove_idle_peer(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::sim::{SimLeaderCommand, SimMySql};
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn call(&self, to: &str, _request: Request) -> Result<Response> {
            Err(Error::Rpc(format!("{to} unreachable")))
        }
    }

    fn raft(dir: &tempfile::TempDir, id: &str) -> Raft {
        let config = Config {
            meta_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        Raft::new(
            id,
            config,
            Arc::new(SimMySql::new(id)),
            Arc::new(SimLeaderCommand::default()),
            Arc::new(Unreachable),
        )
        .unwrap()
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn add_peer_is_idempotent_and_bumps_epoch_once() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        r.add_peer("b:1").unwrap();
        r.add_peer("b:1").unwrap();
        assert_eq!(r.peers(), vec!["b:1".to_string()]);
        assert_eq!(r.epoch_id(), 1);
        r.remove_peer("zzz").unwrap();
        assert_eq!(r.epoch_id(), 1);
    }

    #[test]
    fn adding_the_local_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        r.add_peer("b:1").unwrap();
        r.add_peer("c:1").unwrap();
        assert_eq!(r.shared.member_count(), 3);
        assert_eq!(quorum(r.shared.member_count()), 2);

        r.add_peer("a:1").unwrap();
        r.add_idle_peer("a:1").unwrap();
        assert_eq!(r.epoch_id(), 2);
        assert_eq!(r.peers(), vec!["b:1".to_string(), "c:1".to_string()]);
        assert!(r.idle_peers().is_empty());
        assert!(!r.shared.is_peer("a:1"));
        assert_eq!(r.shared.member_count(), 3);
    }

    #[test]
    fn removing_the_last_voting_peer_drops_quorum_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        r.add_peer("b:1").unwrap();
        r.add_idle_peer("i:1").unwrap();
        assert_eq!(quorum(r.shared.member_count()), 2);

        r.remove_peer("b:1").unwrap();
        assert!(!r.shared.has_peers());
        assert_eq!(r.shared.member_count(), 1);
        assert_eq!(quorum(r.shared.member_count()), 1);
        assert_eq!(r.shared.heartbeat_targets().len(), 1);
    }

    #[test]
    fn membership_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let r = raft(&dir, "a:1");
            r.add_peer("b:1").unwrap();
            r.add_idle_peer("c:1").unwrap();
        }
        let r = raft(&dir, "a:1");
        assert_eq!(r.peers(), vec!["b:1".to_string()]);
        assert_eq!(r.shared.member_count(), 2);
        assert_eq!(r.idle_peers(), vec!["c:1".to_string()]);
        assert!(r.shared.check_request("c:1"));
        assert!(!r.shared.check_request("x:1"));
    }

    #[test]
    fn update_epoch_reconciles_maps() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        r.add_peer("b:1").unwrap();
        r.shared
            .update_epoch(7, vec!["a:1".into(), "c:1".into()], vec!["d:1".into()]);
        assert_eq!(r.epoch_id(), 7);
        assert_eq!(r.peers(), vec!["c:1".to_string()]);
        assert!(!r.shared.is_peer("b:1"));
        assert!(r.shared.is_peer("c:1"));
        assert_eq!(r.shared.advertised_peers(), vec!["c:1".to_string(), "a:1".to_string()]);
        assert_eq!(r.shared.heartbeat_targets().len(), 2);
        assert_eq!(MetaStore::open(r.config().meta_path()).unwrap().read().unwrap().idle_peers, vec!["d:1".to_string()]);
    }

    #[tokio::test]
    async fn send_fails_closed_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        assert!(matches!(r.ping().await, Err(Error::Stop)));

        r.start().await.unwrap();
        assert_eq!(r.ping().await.unwrap().state, State::Follower);

        r.stop().await;
        r.stop().await;
        assert_eq!(r.state(), State::Stopped);
        assert!(matches!(r.ping().await, Err(Error::Stop)));
        assert!(matches!(r.start().await, Err(Error::Stop)));
        assert_eq!(r.status().await.state, State::Stopped);
    }

    #[tokio::test]
    async fn send_fails_closed_when_the_loop_never_answers() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        // Looks running, but nothing drains the event queue.
        r.shared.publish_state(State::Follower);
        let started = time::Instant::now();
        assert!(matches!(r.ping().await, Err(Error::Send)));
        assert!(started.elapsed() >= RESPONSE_TIMEOUT);

        let status = r.status().await;
        assert_eq!(status.state, State::Follower);
        assert!(status.leader.is_none());
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = raft(&dir, "a:1");
        r.add_peer("b:1").unwrap();
        r.start().await.unwrap();
        let resp = r
            .request_vote(RequestVoteRequest {
                view_id: 10,
                epoch_id: 0,
                from: "stranger:1".into(),
                to: "a:1".into(),
                leader: None,
                gtid: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(resp.ret_code, RetCode::InvalidRequest);
        assert_eq!(r.status().await.view_id, 0);
        r.stop().await;
    }

    #[tokio::test]
    async fn super_idle_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            meta_dir: dir.path().to_path_buf(),
            super_idle: true,
            ..Config::default()
        };
        let r = Raft::new(
            "a:1",
            config,
            Arc::new(SimMySql::new("a")),
            Arc::new(SimLeaderCommand::default()),
            Arc::new(Unreachable),
        )
        .unwrap();
        r.start().await.unwrap();
        assert_eq!(r.state(), State::Idle);
        r.stop().await;
    }

    #[test]
    fn unwritable_meta_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let config = Config {
            meta_dir: file.join("meta"),
            ..Config::default()
        };
        let r = Raft::new(
            "a:1",
            config,
            Arc::new(SimMySql::new("a")),
            Arc::new(SimLeaderCommand::default()),
            Arc::new(Unreachable),
        );
        assert!(matches!(r, Err(Error::Io(_))));
    }

    proptest! {
        #[test]
        fn quorum_exceeds_half(members in 1usize..64) {
            let q = quorum(members);
            prop_assert!(q * 2 > members);
            prop_assert!((q - 1) * 2 <= members);
        }
    }
}
