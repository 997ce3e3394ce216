use clap::Parser;
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use myha_local_cluster::{fast_config, local_cluster_tester::LocalClusterRunner};
use myha_raft::Config;

/// Runs an in-process cluster with simulated MySQL and prints each node's
/// status as JSON.
#[derive(Parser, Debug)]
#[command(name = "myha-local-cluster", version)]
struct Args {
    /// Number of cluster members.
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Number of status snapshots to print.
    #[arg(short, long, default_value_t = 5)]
    rounds: u32,

    /// Milliseconds between snapshots.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// TOML file overriding the built-in fast timings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kill the leader after the first snapshot to watch a failover.
    #[arg(long)]
    failover: bool,

    /// Serve tokio-console instead of logging to stderr.
    #[arg(long)]
    console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if args.console {
        console_subscriber::init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => fast_config(),
    };
    info!(nodes = args.nodes, "starting local cluster");
    let cr = LocalClusterRunner::with_setup(args.nodes, config, |_, _| {})?;

    let leader = cr.check_one_leader().await?;
    info!(leader = %leader.id, view = leader.status.view_id, "leader elected");

    for round in 0..args.rounds {
        let nodes = cr.get_cluster_state().await?;
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        if round == 0 && args.failover {
            let leader = cr.check_one_leader().await?;
            info!(leader = %leader.id, "killing leader");
            cr.kill(&leader.id).await?;
        }
        cr.sleep(args.interval_ms).await;
    }
    Ok(())
}
