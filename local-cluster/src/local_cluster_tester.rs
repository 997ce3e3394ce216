use color_eyre::eyre::{bail, eyre, Result};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};

use crate::{fast_config, local_node::LocalNode, local_node::LocalNodeSummary, node_ids, Cluster, CtlMsg};
use myha_raft::{
    msg::{HaCommand, NodeId, PingResponse, RetCode, State, ViewId},
    Config,
};

pub type Nodes = Vec<LocalNodeSummary>;

pub struct LocalClusterRunner {
    ids: Vec<NodeId>,
    config: Config,
    tx: mpsc::Sender<CtlMsg>,
}

impl LocalClusterRunner {
    pub fn new(node_count: usize) -> Result<Self> {
        Self::with_setup(node_count, fast_config(), |_, _| {})
    }

    /// Builds a cluster, letting `setup` prepare each node (for example its
    /// MySQL position) before any of them starts.
    pub fn with_setup(
        node_count: usize,
        config: Config,
        setup: impl Fn(usize, &LocalNode),
    ) -> Result<Self> {
        let (requests_tx, requests_rx) = mpsc::channel(1024);
        let mut c = Cluster::new(node_count, config.clone(), requests_rx, setup)?;
        tokio::spawn(async move {
            c.run().await;
        });
        Ok(Self {
            ids: node_ids(node_count),
            config,
            tx: requests_tx,
        })
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Longest possible election timeout.
    pub fn election_window(&self) -> Duration {
        self.config.election_timeout * 2
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> CtlMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| eyre!("local cluster is gone"))?;
        rx.await.map_err(|_| eyre!("local cluster dropped the request"))
    }

    pub async fn get_cluster_state(&self) -> Result<Nodes> {
        self.request(|tx| CtlMsg::GetClusterState { tx }).await
    }

    pub async fn node(&self, id: &str) -> Result<LocalNodeSummary> {
        self.get_cluster_state()
            .await?
            .into_iter()
            .find(|n| n.id == id)
            .ok_or_else(|| eyre!("no node {id}"))
    }

    pub async fn sleep(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    pub async fn sleep_windows(&self, windows: u32) {
        sleep(self.election_window() * windows).await;
    }

    pub async fn connect(&self, id: &str) -> Result<()> {
        self.tx
            .send(CtlMsg::Connect { dest: id.into() })
            .await
            .map_err(|_| eyre!("failed to send Connect"))
    }

    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.tx
            .send(CtlMsg::Disconnect { dest: id.into() })
            .await
            .map_err(|_| eyre!("failed to send Disconnect"))
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.request(|tx| CtlMsg::Kill { dest: id.into(), tx }).await
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.request(|tx| CtlMsg::Start { dest: id.into(), tx })
            .await?
            .map_err(Into::into)
    }

    pub async fn set_position(&self, id: &str, file: &str, pos: u64) -> Result<()> {
        self.tx
            .send(CtlMsg::SetPosition {
                dest: id.into(),
                file: file.into(),
                pos,
            })
            .await
            .map_err(|_| eyre!("failed to send SetPosition"))
    }

    pub async fn ha(&self, id: &str, command: HaCommand) -> Result<RetCode> {
        self.request(|tx| CtlMsg::Ha {
            dest: id.into(),
            command,
            tx,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn add_peer(&self, id: &str, peer: &str) -> Result<()> {
        self.request(|tx| CtlMsg::AddPeer {
            dest: id.into(),
            peer: peer.into(),
            tx,
        })
        .await?
        .map_err(Into::into)
    }

    /// Pings `to` from `from` across the simulated network. An unreachable
    /// target answers with `RetCode::RpcCall`.
    pub async fn ping(&self, from: &str, to: &str) -> Result<PingResponse> {
        self.request(|tx| CtlMsg::Ping {
            from: from.into(),
            to: to.into(),
            tx,
        })
        .await
    }

    /// Only one live leader at the highest view.
    pub async fn check_one_leader(&self) -> Result<LocalNodeSummary> {
        let iterations = 40;
        for _ in 0..iterations {
            self.sleep(100).await;
            let nodes = self.get_cluster_state().await?;
            let highest_leaders = leaders(&nodes);
            match highest_leaders.len() {
                1 => return Ok(highest_leaders[0].clone()),
                l if l > 1 => bail!("More than one leader in the same view!"),
                _ => {}
            }
        }
        bail!("No leader elected in time!")
    }

    pub async fn has_no_leader(&self) -> Result<bool> {
        Ok(leaders(&self.get_cluster_state().await?).is_empty())
    }

    pub async fn current_view(&self) -> Result<ViewId> {
        let nodes = self.get_cluster_state().await?;
        Ok(nodes.iter().map(|n| n.status.view_id).max().unwrap_or(0))
    }

    /// Whether every live, connected node follows `leader`.
    pub async fn all_follow(&self, leader: &str) -> Result<bool> {
        let nodes = self.get_cluster_state().await?;
        Ok(nodes
            .iter()
            .filter(|n| !n.is_dead && !n.is_disconnected && n.id != leader)
            .all(|n| n.status.leader.as_deref() == Some(leader)))
    }

    pub async fn live_view_agreement(&self) -> Result<bool> {
        let nodes = self.get_cluster_state().await?;
        let mut views = nodes
            .iter()
            .filter(|n| !n.is_dead && !n.is_disconnected)
            .map(|n| n.status.view_id);
        let Some(first) = views.next() else {
            return Ok(true);
        };
        Ok(views.all(|v| v == first))
    }

    /// Polls until `check` holds for the cluster state or the iterations run
    /// out.
    pub async fn wait_for(&self, mut check: impl FnMut(&Nodes) -> bool) -> Result<Nodes> {
        for _ in 0..40 {
            let nodes = self.get_cluster_state().await?;
            if check(&nodes) {
                return Ok(nodes);
            }
            self.sleep(100).await;
        }
        bail!("cluster did not reach the expected state in time")
    }
}

impl Drop for LocalClusterRunner {
    fn drop(&mut self) {
        let tx = self.tx.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = tx.send(CtlMsg::Shutdown).await;
            });
        }
    }
}

fn leaders(nodes: &Nodes) -> Vec<LocalNodeSummary> {
    let live = nodes
        .iter()
        .filter(|n| !n.is_dead && !n.is_disconnected && n.status.state == State::Leader);
    let Some(highest_view) = live.clone().map(|n| n.status.view_id).max() else {
        return Vec::new();
    };
    live.filter(|n| n.status.view_id == highest_view)
        .cloned()
        .collect()
}
