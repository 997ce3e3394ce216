use ahash::{HashMap, HashMapExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub mod local_cluster_tester;
pub mod local_node;

use crate::local_node::{Envelope, LocalNode, LocalNodeSummary, LocalTransport};
use myha_raft::{
    msg::{HaCommand, NodeId, PingResponse, RetCode},
    peer::Peer,
    Config, Error, Result,
};

/// Control requests from the cluster runner. Each carries its own reply
/// channel.
pub enum CtlMsg {
    GetClusterState {
        tx: oneshot::Sender<Vec<LocalNodeSummary>>,
    },
    Kill {
        dest: NodeId,
        tx: oneshot::Sender<()>,
    },
    Start {
        dest: NodeId,
        tx: oneshot::Sender<Result<()>>,
    },
    Connect {
        dest: NodeId,
    },
    Disconnect {
        dest: NodeId,
    },
    SetPosition {
        dest: NodeId,
        file: String,
        pos: u64,
    },
    Ha {
        dest: NodeId,
        command: HaCommand,
        tx: oneshot::Sender<Result<RetCode>>,
    },
    AddPeer {
        dest: NodeId,
        peer: NodeId,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Liveness check from one member to another over the simulated network.
    Ping {
        from: NodeId,
        to: NodeId,
        tx: oneshot::Sender<PingResponse>,
    },
    Shutdown,
}

/// Node ids used by a local cluster of `node_count` members.
pub fn node_ids(node_count: usize) -> Vec<NodeId> {
    (0..node_count)
        .map(|i| format!("127.0.0.1:{}", 6000 + i))
        .collect()
}

/// Timings small enough for a cluster test to converge in seconds.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout: Duration::from_millis(300),
        rpc_timeout: Duration::from_millis(40),
        brain_split_check_interval: Duration::from_millis(500),
        check_semi_sync_interval: Duration::from_millis(200),
        purge_binlog_interval: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Owns every local node and plays the network between them: an RPC only
/// reaches its destination when both ends are alive and connected.
pub struct Cluster {
    nodes: HashMap<NodeId, LocalNode>,
    /// Channel for messages from cluster runner
    ctl_requests: mpsc::Receiver<CtlMsg>,
    /// Calls sent by nodes to each other
    network_rx: mpsc::Receiver<Envelope>,
    network_tx: mpsc::Sender<Envelope>,
    rpc_timeout: Duration,
    _meta_root: tempfile::TempDir,
}

impl Cluster {
    /// Builds `node_count` members that all know each other. Nodes start
    /// when [`Cluster::run`] does, after `setup` has seen each one.
    pub fn new(
        node_count: usize,
        config: Config,
        ctl_requests: mpsc::Receiver<CtlMsg>,
        setup: impl Fn(usize, &LocalNode),
    ) -> Result<Self> {
        let meta_root = tempfile::tempdir()?;
        let (network_tx, network_rx) = mpsc::channel(1024);
        let ids = node_ids(node_count);
        let rpc_timeout = config.rpc_timeout;
        let mut nodes = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            let config = Config {
                meta_dir: meta_root.path().join(format!("node{i}")),
                ..config.clone()
            };
            let node = LocalNode::new(id.clone(), config, network_tx.clone())?;
            for peer in &ids {
                node.raft().add_peer(peer)?;
            }
            setup(i, &node);
            nodes.insert(id.clone(), node);
        }
        Ok(Self {
            nodes,
            ctl_requests,
            network_rx,
            network_tx,
            rpc_timeout,
            _meta_root: meta_root,
        })
    }

    pub async fn run(&mut self) {
        for node in self.nodes.values_mut() {
            if let Err(e) = node.start().await {
                warn!(id = %node.id, error = %e, "failed to start local node");
            }
        }
        loop {
            tokio::select! {
                Some(msg) = self.ctl_requests.recv() => {
                    if matches!(msg, CtlMsg::Shutdown) {
                        return self.shutdown().await;
                    }
                    self.process_ctl_msg(msg).await;
                }
                Some(envelope) = self.network_rx.recv() => self.route(envelope),
                else => return self.shutdown().await,
            }
        }
    }

    /// Delivers a call on its own task so a slow handler never stalls the
    /// network.
    fn route(&self, envelope: Envelope) {
        let Envelope {
            from,
            to,
            request,
            tx,
        } = envelope;
        let reachable = |id: &str| self.nodes.get(id).is_some_and(LocalNode::is_reachable);
        if !reachable(&from) || !reachable(&to) {
            let _ = tx.send(Err(Error::Rpc(format!("{from} cannot reach {to}"))));
            return;
        }
        let Some(raft) = self.nodes.get(&to).map(|n| n.raft().clone()) else {
            return;
        };
        tokio::spawn(async move {
            let _ = tx.send(raft.handle(request).await);
        });
    }

    /// Process messages sent from cluster runner
    async fn process_ctl_msg(&mut self, msg: CtlMsg) {
        use CtlMsg::*;
        match msg {
            GetClusterState { tx } => {
                let mut nodes = Vec::with_capacity(self.nodes.len());
                for node in self.nodes.values() {
                    nodes.push(node.summary().await);
                }
                nodes.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = tx.send(nodes);
            }
            Kill { dest, tx } => {
                if let Some(node) = self.nodes.get_mut(&dest) {
                    node.kill().await;
                }
                let _ = tx.send(());
            }
            Start { dest, tx } => {
                let result = match self.nodes.get_mut(&dest) {
                    Some(node) => node.start().await,
                    None => Err(unknown(&dest)),
                };
                let _ = tx.send(result);
            }
            Connect { dest } => {
                if let Some(node) = self.nodes.get_mut(&dest) {
                    debug!(id = %dest, "connecting");
                    node.connect();
                }
            }
            Disconnect { dest } => {
                if let Some(node) = self.nodes.get_mut(&dest) {
                    debug!(id = %dest, "disconnecting");
                    node.disconnect();
                }
            }
            SetPosition { dest, file, pos } => {
                if let Some(node) = self.nodes.get(&dest) {
                    node.mysql().set_position(&file, pos);
                }
            }
            Ha { dest, command, tx } => {
                let raft = self.nodes.get(&dest).map(|n| n.raft().clone());
                tokio::spawn(async move {
                    let result = match raft {
                        Some(raft) => raft.ha("local-cluster", command).await,
                        None => Err(unknown(&dest)),
                    };
                    let _ = tx.send(result);
                });
            }
            AddPeer { dest, peer, tx } => {
                let result = match self.nodes.get(&dest) {
                    Some(node) => node.raft().add_peer(&peer),
                    None => Err(unknown(&dest)),
                };
                let _ = tx.send(result);
            }
            Ping { from, to, tx } => {
                let transport = LocalTransport::new(from, self.network_tx.clone());
                let peer = Peer::new(to, Arc::new(transport), self.rpc_timeout);
                tokio::spawn(async move {
                    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
                    peer.send_ping(resp_tx).await;
                    if let Some(resp) = resp_rx.recv().await {
                        let _ = tx.send(resp);
                    }
                });
            }
            Shutdown => unreachable!("shutdown is handled by the run loop"),
        }
    }

    async fn shutdown(&mut self) {
        info!("local cluster shutting down");
        for node in self.nodes.values_mut() {
            node.kill().await;
        }
    }
}

fn unknown(id: &str) -> Error {
    Error::Rpc(format!("no local node {id}"))
}
