use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime tunables of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Leader heartbeat period.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,

    /// Deadline for a single outbound peer call.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Consecutive under-quorum heartbeat rounds before a Leader steps down.
    pub admit_defeat_ht_cnt: u32,

    #[serde(with = "humantime_serde")]
    pub purge_binlog_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub check_semi_sync_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub brain_split_check_interval: Duration,

    /// Semi-sync master timeout used while the cluster has fewer than three
    /// members.
    pub semi_sync_small_cluster_timeout_ms: u64,

    /// Directory holding `meta.json`.
    pub meta_dir: PathBuf,

    /// Start in Idle instead of Follower.
    pub super_idle: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            election_timeout: Duration::from_secs(3),
            rpc_timeout: Duration::from_millis(500),
            admit_defeat_ht_cnt: 4,
            purge_binlog_interval: Duration::from_secs(60),
            check_semi_sync_interval: Duration::from_secs(10),
            brain_split_check_interval: Duration::from_secs(10),
            semi_sync_small_cluster_timeout_ms: 300_000,
            meta_dir: PathBuf::from("./meta"),
            super_idle: false,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be positive".into()));
        }
        if self.election_timeout <= self.heartbeat_interval {
            return Err(Error::Config(
                "election_timeout must exceed heartbeat_interval".into(),
            ));
        }
        for (name, period) in [
            ("rpc_timeout", self.rpc_timeout),
            ("purge_binlog_interval", self.purge_binlog_interval),
            ("check_semi_sync_interval", self.check_semi_sync_interval),
            ("brain_split_check_interval", self.brain_split_check_interval),
        ] {
            if period.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Randomized election timeout in `[election_timeout, 2 * election_timeout)`.
    pub fn random_election_timeout(&self) -> Duration {
        let low = self.election_timeout;
        rand::thread_rng().gen_range(low..low * 2)
    }

    pub fn vote_check_interval(&self) -> Duration {
        self.election_timeout / 2
    }

    pub fn meta_path(&self) -> PathBuf {
        self.meta_dir.join("meta.json")
    }
}
