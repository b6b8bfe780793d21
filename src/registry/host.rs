//! Host record types

use std::collections::BTreeSet;
use std::time::Instant;

use crate::health::HealthLevel;

/// Lifecycle status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Registered and responding to heartbeats
    Active,
    /// No successful ping for longer than the stale threshold
    Stale,
    /// Too many consecutive heartbeat failures, or reported dead
    Error,
    /// Explicitly shut down
    Terminated,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    /// A host in any non-active state cannot run workers.
    pub fn is_dead(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Opaque per-host configuration.
#[derive(Debug, Clone, Default)]
pub struct HostOpts {
    /// Socket name the editor client connects to; `None` lets the
    /// client use its own default.
    pub socket_name: Option<String>,
}

/// A host as tracked by the registry.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub id: String,
    pub status: HostStatus,
    /// Health score in `[0, 100]`, EWMA-smoothed.
    pub health_score: i64,
    /// Consecutive failed heartbeats.
    pub error_count: u32,
    /// Time of the last successful ping.
    pub heartbeat_at: Option<Instant>,
    pub registered_at: Instant,
    pub last_error: Option<String>,
    /// Workers bound to this host. Ordered for deterministic iteration.
    pub workers: BTreeSet<String>,
    pub opts: HostOpts,
}

impl HostRecord {
    pub fn new(id: String, opts: HostOpts) -> Self {
        Self {
            id,
            status: HostStatus::Active,
            health_score: crate::health::SCORE_MAX,
            error_count: 0,
            heartbeat_at: None,
            registered_at: Instant::now(),
            last_error: None,
            workers: BTreeSet::new(),
            opts,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn health_level(&self) -> HealthLevel {
        HealthLevel::from_score(self.health_score)
    }
}
