use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// One pooled runtime instance.
///
/// The pool owns the authoritative copy; callers of `acquire` receive a
/// snapshot and hand back only the id.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub id: String,
    pub name: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u32,
    pub healthy: bool,
    pub network_enabled: bool,
    /// Private directory on the host, bind-mounted into the instance.
    pub host_dir: PathBuf,
    /// The same directory as seen from inside the instance.
    pub container_dir: String,
}

impl RuntimeInstance {
    pub fn new(
        id: String,
        name: String,
        host_dir: PathBuf,
        container_dir: String,
        network_enabled: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            created_at: now,
            last_used: now,
            use_count: 0,
            healthy: true,
            network_enabled,
            host_dir,
            container_dir,
        }
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_expired(&self, max_uses: u32, max_idle: Duration) -> bool {
        self.use_count >= max_uses || self.idle_time() > max_idle
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Which kind of instance a caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceProfile {
    pub network_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    /// Percentage of requests served without creating an instance.
    pub hit_rate: f64,
}

impl PoolStatistics {
    pub(crate) fn hit_rate(hits: u64, requests: u64) -> f64 {
        if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64 * 100.0
        }
    }
}
