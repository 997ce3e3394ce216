use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use myha_raft::{
    msg::{NodeId, Request, Response, Status},
    mysql::sim::{SimLeaderCommand, SimMySql},
    transport::Transport,
    Config, Error, Raft, Result,
};

/// One RPC in flight through the simulated network.
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub request: Request,
    pub tx: oneshot::Sender<Result<Response>>,
}

/// Hands every outgoing call to the cluster, which decides whether it
/// reaches its destination.
pub struct LocalTransport {
    from: NodeId,
    network: mpsc::Sender<Envelope>,
}

impl LocalTransport {
    pub fn new(from: NodeId, network: mpsc::Sender<Envelope>) -> Self {
        Self { from, network }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, to: &str, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            from: self.from.clone(),
            to: to.to_string(),
            request,
            tx,
        };
        self.network
            .send(envelope)
            .await
            .map_err(|_| Error::Rpc("network is shut down".into()))?;
        rx.await
            .map_err(|_| Error::Rpc(format!("{to} dropped the call")))?
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LocalNodeSummary {
    pub id: NodeId,
    pub is_dead: bool,
    pub is_disconnected: bool,
    pub status: Status,
}

/// Simulates a cluster member on a network but run locally: the election
/// engine plus a simulated MySQL that outlives agent restarts.
pub struct LocalNode {
    pub id: NodeId,
    pub is_disconnected: bool,
    pub is_dead: bool,
    raft: Raft,
    config: Config,
    mysql: Arc<SimMySql>,
    leader_command: Arc<SimLeaderCommand>,
    network: mpsc::Sender<Envelope>,
}

impl LocalNode {
    pub fn new(id: NodeId, config: Config, network: mpsc::Sender<Envelope>) -> Result<Self> {
        let mysql = Arc::new(SimMySql::new(id.clone()));
        let leader_command = Arc::new(SimLeaderCommand::default());
        let raft = Self::build(&id, &config, &mysql, &leader_command, &network)?;
        Ok(Self {
            id,
            is_disconnected: false,
            is_dead: true,
            raft,
            config,
            mysql,
            leader_command,
            network,
        })
    }

    fn build(
        id: &NodeId,
        config: &Config,
        mysql: &Arc<SimMySql>,
        leader_command: &Arc<SimLeaderCommand>,
        network: &mpsc::Sender<Envelope>,
    ) -> Result<Raft> {
        let transport = LocalTransport::new(id.clone(), network.clone());
        Raft::new(
            id.clone(),
            config.clone(),
            mysql.clone(),
            leader_command.clone(),
            Arc::new(transport),
        )
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn mysql(&self) -> &Arc<SimMySql> {
        &self.mysql
    }

    pub fn leader_command(&self) -> &Arc<SimLeaderCommand> {
        &self.leader_command
    }

    pub fn is_reachable(&self) -> bool {
        !self.is_dead && !self.is_disconnected
    }

    /// Starts the agent. A killed agent is rebuilt from its meta directory,
    /// the way a restarted process would recover.
    pub async fn start(&mut self) -> Result<()> {
        if !self.is_dead {
            return Ok(());
        }
        if let Err(Error::Stop) = self.raft.start().await {
            self.raft = Self::build(
                &self.id,
                &self.config,
                &self.mysql,
                &self.leader_command,
                &self.network,
            )?;
            self.raft.start().await?;
        }
        info!(id = %self.id, "local node started");
        self.is_dead = false;
        Ok(())
    }

    pub async fn kill(&mut self) {
        if self.is_dead {
            return;
        }
        info!(id = %self.id, "killing local node");
        self.raft.stop().await;
        self.is_dead = true;
    }

    pub fn connect(&mut self) {
        self.is_disconnected = false;
    }

    pub fn disconnect(&mut self) {
        self.is_disconnected = true;
    }

    pub async fn summary(&self) -> LocalNodeSummary {
        LocalNodeSummary {
            id: self.id.clone(),
            is_dead: self.is_dead,
            is_disconnected: self.is_disconnected,
            status: self.raft.status().await,
        }
    }
}
