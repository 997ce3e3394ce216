//! The MySQL and shell collaborators the engine drives.
//!
//! The engine never talks SQL itself. It consumes the capabilities below and
//! compares replication positions through [`Gtid`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Replication position of a MySQL instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gtid {
    /// Binlog file of the last event read (replica) or written (master).
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub executed_gtid_set: String,
    pub retrieved_gtid_set: String,
    pub slave_io_running: bool,
    pub slave_sql_running: bool,
    pub seconds_behind_master: Option<u64>,
}

impl Gtid {
    pub fn at(file: impl Into<String>, pos: u64) -> Self {
        Self {
            master_log_file: file.into(),
            read_master_log_pos: pos,
            ..Default::default()
        }
    }

    /// Orders by binlog file sequence, then position within the file.
    pub fn position_cmp(&self, other: &Gtid) -> Ordering {
        compare_log_files(&self.master_log_file, &other.master_log_file)
            .then(self.read_master_log_pos.cmp(&other.read_master_log_pos))
    }

    pub fn greater_than(&self, other: &Gtid) -> bool {
        self.position_cmp(other) == Ordering::Greater
    }
}

fn log_file_seq(name: &str) -> Option<u64> {
    name.rsplit_once('.').and_then(|(_, seq)| seq.parse().ok())
}

/// Compares binlog file names such as `mysql-bin.000123` by sequence number,
/// falling back to plain string order for names without one.
pub fn compare_log_files(a: &str, b: &str) -> Ordering {
    match (log_file_seq(a), log_file_seq(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Coordinates a replica needs for `CHANGE MASTER TO`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repl {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Repl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Control surface of the local MySQL instance.
#[async_trait]
pub trait MySql: Send + Sync {
    /// Alive and replication SQL thread running.
    async fn promotable(&self) -> bool;

    async fn gtid(&self) -> Result<Gtid>;

    /// Whether the local position is strictly ahead of `other`, together with
    /// the local position.
    async fn gtid_greater_than(&self, other: &Gtid) -> Result<(bool, Gtid)> {
        let local = self.gtid().await?;
        Ok((local.greater_than(other), local))
    }

    async fn set_read_only(&self) -> Result<()>;
    async fn set_read_write(&self) -> Result<()>;
    async fn start_slave(&self) -> Result<()>;
    async fn stop_slave_io_thread(&self) -> Result<()>;
    async fn change_master_to(&self, repl: &Repl) -> Result<()>;
    /// Stops replication and turns the instance into a master.
    async fn change_to_master(&self) -> Result<()>;
    /// Blocks until the SQL thread has applied `gtid_set`.
    async fn wait_until_after_gtid(&self, gtid_set: &str) -> Result<()>;
    async fn reset_slave_all(&self) -> Result<()>;
    async fn enable_semi_sync_master(&self) -> Result<()>;
    async fn disable_semi_sync_master(&self) -> Result<()>;
    async fn set_semi_wait_slave_count(&self, count: usize) -> Result<()>;
    async fn set_semi_sync_master_timeout(&self, timeout_ms: u64) -> Result<()>;
    async fn purge_binlogs_to(&self, log_file: &str) -> Result<()>;
    async fn set_master_global_sys_var(&self) -> Result<()>;
    async fn set_slave_global_sys_var(&self) -> Result<()>;
    /// Oldest master binlog this replica still needs, if replicating.
    async fn relay_master_log_file(&self) -> Option<String>;
    /// Coordinates other members use to replicate from this instance.
    fn repl(&self) -> Repl;
}

/// VIP attach/detach hooks run around leadership.
#[async_trait]
pub trait LeaderCommand: Send + Sync {
    async fn run_leader_start_command(&self) -> Result<()>;
    async fn run_leader_stop_command(&self) -> Result<()>;
}

/// Runs operator-provided shell snippets through `sh -c`.
#[derive(Clone, Debug, Default)]
pub struct ShellCommand {
    pub start: Option<String>,
    pub stop: Option<String>,
}

impl ShellCommand {
    async fn run(cmd: &Option<String>) -> Result<()> {
        let Some(cmd) = cmd else {
            return Ok(());
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Shell(format!("`{cmd}` exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderCommand for ShellCommand {
    async fn run_leader_start_command(&self) -> Result<()> {
        Self::run(&self.start).await
    }

    async fn run_leader_stop_command(&self) -> Result<()> {
        Self::run(&self.stop).await
    }
}

pub mod sim {
    //! In-memory collaborators for tests and local clusters.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    #[derive(Debug)]
    struct SimState {
        alive: bool,
        gtid: Gtid,
        read_only: bool,
        semi_sync_master: bool,
        semi_wait_slave_count: usize,
        semi_sync_master_timeout: u64,
        master: Option<Repl>,
        is_master: bool,
        purged_to: Option<String>,
        fail_change_master: bool,
        calls: Vec<&'static str>,
    }

    /// A MySQL stand-in that records calls and lets tests move its position.
    #[derive(Debug)]
    pub struct SimMySql {
        repl: Repl,
        state: Mutex<SimState>,
    }

    impl SimMySql {
        pub fn new(host: impl Into<String>) -> Self {
            let mut gtid = Gtid::at("mysql-bin.000001", 4);
            gtid.slave_sql_running = true;
            gtid.slave_io_running = true;
            Self {
                repl: Repl {
                    host: host.into(),
                    port: 3306,
                    user: "repl".into(),
                    password: "repl".into(),
                },
                state: Mutex::new(SimState {
                    alive: true,
                    gtid,
                    read_only: true,
                    semi_sync_master: false,
                    semi_wait_slave_count: 0,
                    semi_sync_master_timeout: 0,
                    master: None,
                    is_master: false,
                    purged_to: None,
                    fail_change_master: false,
                    calls: Vec::new(),
                }),
            }
        }

        pub fn set_position(&self, file: &str, pos: u64) {
            let mut s = self.state.lock();
            s.gtid.master_log_file = file.into();
            s.gtid.read_master_log_pos = pos;
        }

        pub fn set_alive(&self, alive: bool) {
            self.state.lock().alive = alive;
        }

        pub fn set_sql_running(&self, running: bool) {
            self.state.lock().gtid.slave_sql_running = running;
        }

        pub fn set_fail_change_master(&self, fail: bool) {
            self.state.lock().fail_change_master = fail;
        }

        pub fn is_read_only(&self) -> bool {
            self.state.lock().read_only
        }

        pub fn is_master(&self) -> bool {
            self.state.lock().is_master
        }

        pub fn master(&self) -> Option<Repl> {
            self.state.lock().master.clone()
        }

        pub fn semi_sync(&self) -> (bool, usize, u64) {
            let s = self.state.lock();
            (s.semi_sync_master, s.semi_wait_slave_count, s.semi_sync_master_timeout)
        }

        pub fn purged_to(&self) -> Option<String> {
            self.state.lock().purged_to.clone()
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.state.lock().calls.clone()
        }

        fn call(&self, name: &'static str) -> Result<parking_lot::MutexGuard<'_, SimState>> {
            let mut s = self.state.lock();
            s.calls.push(name);
            if !s.alive {
                return Err(Error::MySql(format!("{name}: mysql is down")));
            }
            Ok(s)
        }
    }

    #[async_trait]
    impl MySql for SimMySql {
        async fn promotable(&self) -> bool {
            let s = self.state.lock();
            s.alive && (s.gtid.slave_sql_running || s.is_master)
        }

        async fn gtid(&self) -> Result<Gtid> {
            Ok(self.call("gtid")?.gtid.clone())
        }

        async fn set_read_only(&self) -> Result<()> {
            self.call("set_read_only")?.read_only = true;
            Ok(())
        }

        async fn set_read_write(&self) -> Result<()> {
            self.call("set_read_write")?.read_only = false;
            Ok(())
        }

        async fn start_slave(&self) -> Result<()> {
            let mut s = self.call("start_slave")?;
            if s.master.is_some() {
                s.gtid.slave_io_running = true;
                s.gtid.slave_sql_running = true;
            }
            Ok(())
        }

        async fn stop_slave_io_thread(&self) -> Result<()> {
            self.call("stop_slave_io_thread")?.gtid.slave_io_running = false;
            Ok(())
        }

        async fn change_master_to(&self, repl: &Repl) -> Result<()> {
            let mut s = self.call("change_master_to")?;
            if s.fail_change_master {
                return Err(Error::MySql("change master rejected".into()));
            }
            s.master = Some(repl.clone());
            s.is_master = false;
            s.gtid.slave_io_running = true;
            s.gtid.slave_sql_running = true;
            Ok(())
        }

        async fn change_to_master(&self) -> Result<()> {
            let mut s = self.call("change_to_master")?;
            s.is_master = true;
            s.gtid.slave_io_running = false;
            s.gtid.slave_sql_running = false;
            Ok(())
        }

        async fn wait_until_after_gtid(&self, _gtid_set: &str) -> Result<()> {
            self.call("wait_until_after_gtid")?;
            Ok(())
        }

        async fn reset_slave_all(&self) -> Result<()> {
            self.call("reset_slave_all")?.master = None;
            Ok(())
        }

        async fn enable_semi_sync_master(&self) -> Result<()> {
            self.call("enable_semi_sync_master")?.semi_sync_master = true;
            Ok(())
        }

        async fn disable_semi_sync_master(&self) -> Result<()> {
            self.call("disable_semi_sync_master")?.semi_sync_master = false;
            Ok(())
        }

        async fn set_semi_wait_slave_count(&self, count: usize) -> Result<()> {
            self.call("set_semi_wait_slave_count")?.semi_wait_slave_count = count;
            Ok(())
        }

        async fn set_semi_sync_master_timeout(&self, timeout_ms: u64) -> Result<()> {
            self.call("set_semi_sync_master_timeout")?.semi_sync_master_timeout = timeout_ms;
            Ok(())
        }

        async fn purge_binlogs_to(&self, log_file: &str) -> Result<()> {
            self.call("purge_binlogs_to")?.purged_to = Some(log_file.to_string());
            Ok(())
        }

        async fn set_master_global_sys_var(&self) -> Result<()> {
            self.call("set_master_global_sys_var")?;
            Ok(())
        }

        async fn set_slave_global_sys_var(&self) -> Result<()> {
            self.call("set_slave_global_sys_var")?;
            Ok(())
        }

        async fn relay_master_log_file(&self) -> Option<String> {
            let s = self.state.lock();
            (s.alive && !s.is_master).then(|| s.gtid.master_log_file.clone())
        }

        fn repl(&self) -> Repl {
            self.repl.clone()
        }
    }

    /// Counts leader start/stop hook invocations.
    #[derive(Debug, Default)]
    pub struct SimLeaderCommand {
        starts: AtomicU64,
        stops: AtomicU64,
    }

    impl SimLeaderCommand {
        pub fn starts(&self) -> u64 {
            self.starts.load(AtomicOrdering::SeqCst)
        }

        pub fn stops(&self) -> u64 {
            self.stops.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl LeaderCommand for SimLeaderCommand {
        async fn run_leader_start_command(&self) -> Result<()> {
            self.starts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn run_leader_stop_command(&self) -> Result<()> {
            self.stops.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }
}
