use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters of protocol activity.
#[derive(Debug, Default)]
pub struct Stats {
    pub promotions: AtomicU64,
    pub degrades: AtomicU64,
    pub elections: AtomicU64,
    pub votes_granted: AtomicU64,
    pub heartbeat_rounds: AtomicU64,
    pub heartbeat_loss: AtomicU64,
    pub purges: AtomicU64,
    pub purge_failures: AtomicU64,
    pub change_master_errors: AtomicU64,
    pub brain_split_bumps: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub promotions: u64,
    pub degrades: u64,
    pub elections: u64,
    pub votes_granted: u64,
    pub heartbeat_rounds: u64,
    pub heartbeat_loss: u64,
    pub purges: u64,
    pub purge_failures: u64,
    pub change_master_errors: u64,
    pub brain_split_bumps: u64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            promotions: get(&self.promotions),
            degrades: get(&self.degrades),
            elections: get(&self.elections),
            votes_granted: get(&self.votes_granted),
            heartbeat_rounds: get(&self.heartbeat_rounds),
            heartbeat_loss: get(&self.heartbeat_loss),
            purges: get(&self.purges),
            purge_failures: get(&self.purge_failures),
            change_master_errors: get(&self.change_master_errors),
            brain_split_bumps: get(&self.brain_split_bumps),
        }
    }
}
