//! Host registry: lifecycle state and worker bindings for the fleet
//!
//! One lock guards the host map and the worker index together, so
//! every operation is linearizable and a worker is bound to at most
//! one host at any observable point. Bind carries the worker's project
//! id; the registry caches it so placement affinity never reads the
//! external worker store.

mod host;

pub use host::{HostOpts, HostRecord, HostStatus};

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::health;
use crate::rpc::HostErrorSink;

/// Consecutive heartbeat failures before a host is marked errored.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("worker {worker} is not bound to host {host}")]
    NotBound { worker: String, host: String },
}

/// Fleet-wide counts for status output and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub error: usize,
    pub terminated: usize,
    pub workers: usize,
}

#[derive(Default)]
struct Inner {
    hosts: BTreeMap<String, HostRecord>,
    /// worker id -> host id
    worker_hosts: HashMap<String, String>,
    /// worker id -> project id, cached at bind time
    worker_projects: HashMap<String, Option<String>>,
}

/// In-memory store of host records and worker-to-host bindings.
pub struct HostRegistry {
    inner: RwLock<Inner>,
    failure_threshold: u32,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::with_failure_threshold(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(failure_threshold: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Register a host. Idempotent: an existing record is left alone.
    /// Returns true when a new host was created.
    pub fn register(&self, id: &str, opts: HostOpts) -> bool {
        let mut inner = self.inner.write();
        if inner.hosts.contains_key(id) {
            debug!(host = id, "Host already registered");
            return false;
        }
        inner
            .hosts
            .insert(id.to_string(), HostRecord::new(id.to_string(), opts));
        info!(host = id, "Host registered");
        true
    }

    /// Record a successful heartbeat: rescore, clear the failure run,
    /// and restore the active status.
    pub fn heartbeat_success(&self, id: &str, elapsed_ms: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.hosts.get_mut(id) else {
            warn!(host = id, "Heartbeat success for unknown host");
            return false;
        };
        let recovering = record.error_count > 0;
        record.health_score = health::rescore(
            record.health_score,
            Some(elapsed_ms),
            0,
            record.workers.len(),
            recovering,
        );
        record.error_count = 0;
        record.heartbeat_at = Some(Instant::now());
        if record.status != HostStatus::Active {
            info!(
                host = id,
                status = record.status.as_str(),
                "Host recovered to active"
            );
            record.status = HostStatus::Active;
        }
        debug!(
            host = id,
            elapsed_ms,
            score = record.health_score,
            "Heartbeat succeeded"
        );
        true
    }

    /// Record a failed heartbeat: rescore with a failed measurement and
    /// mark the host errored once the failure run crosses the threshold.
    pub fn heartbeat_failure(&self, id: &str, error: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.hosts.get_mut(id) else {
            warn!(host = id, "Heartbeat failure for unknown host");
            return false;
        };
        record.error_count += 1;
        record.health_score = health::rescore(
            record.health_score,
            None,
            record.error_count,
            record.workers.len(),
            false,
        );
        record.last_error = Some(error.to_string());
        if record.error_count >= self.failure_threshold && record.status != HostStatus::Error {
            record.status = HostStatus::Error;
            warn!(
                host = id,
                error_count = record.error_count,
                error,
                "Host marked errored"
            );
        } else {
            debug!(
                host = id,
                error_count = record.error_count,
                score = record.health_score,
                error,
                "Heartbeat failed"
            );
        }
        true
    }

    pub fn mark_stale(&self, id: &str) -> bool {
        self.set_status(id, HostStatus::Stale)
    }

    pub fn mark_terminated(&self, id: &str) -> bool {
        self.set_status(id, HostStatus::Terminated)
    }

    /// Mark a host errored from an out-of-band report (e.g. the RPC
    /// client matched a host-death pattern). The error count is forced
    /// up to the threshold so the errored status is always backed by
    /// one.
    pub fn mark_error(&self, id: &str, message: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.hosts.get_mut(id) else {
            warn!(host = id, message, "Error report for unknown host");
            return false;
        };
        record.status = HostStatus::Error;
        record.error_count = record.error_count.max(self.failure_threshold);
        record.last_error = Some(message.to_string());
        warn!(host = id, error = message, "Host marked errored");
        true
    }

    fn set_status(&self, id: &str, status: HostStatus) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.hosts.get_mut(id) else {
            return false;
        };
        if record.status != status {
            info!(
                host = id,
                from = record.status.as_str(),
                to = status.as_str(),
                "Host status changed"
            );
            record.status = status;
        }
        true
    }

    /// Bind a worker to a host, recording its project for affinity. A
    /// binding to another host is replaced, never duplicated.
    pub fn bind(&self, host_id: &str, worker_id: &str, project_id: Option<&str>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if !inner.hosts.contains_key(host_id) {
            return Err(RegistryError::UnknownHost(host_id.to_string()));
        }
        if let Some(prev) = inner.worker_hosts.get(worker_id).cloned() {
            if let Some(record) = inner.hosts.get_mut(&prev) {
                record.workers.remove(worker_id);
            }
        }
        if let Some(record) = inner.hosts.get_mut(host_id) {
            record.workers.insert(worker_id.to_string());
        }
        inner
            .worker_hosts
            .insert(worker_id.to_string(), host_id.to_string());
        inner
            .worker_projects
            .insert(worker_id.to_string(), project_id.map(str::to_string));
        debug!(host = host_id, worker = worker_id, "Worker bound");
        Ok(())
    }

    /// Remove a worker's binding from a host. Returns false when the
    /// worker was not bound there.
    pub fn unbind(&self, host_id: &str, worker_id: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner
            .hosts
            .get_mut(host_id)
            .map(|r| r.workers.remove(worker_id))
            .unwrap_or(false);
        if removed {
            if inner.worker_hosts.get(worker_id).map(String::as_str) == Some(host_id) {
                inner.worker_hosts.remove(worker_id);
                inner.worker_projects.remove(worker_id);
            }
            debug!(host = host_id, worker = worker_id, "Worker unbound");
        }
        removed
    }

    /// Move a worker between hosts in one step. Fails when the worker
    /// is not currently on `from` or the target does not exist; no
    /// reader ever observes the worker on zero or two hosts.
    pub fn migrate(&self, worker_id: &str, from: &str, to: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.worker_hosts.get(worker_id).map(String::as_str) != Some(from) {
            return Err(RegistryError::NotBound {
                worker: worker_id.to_string(),
                host: from.to_string(),
            });
        }
        if !inner.hosts.contains_key(to) {
            return Err(RegistryError::UnknownHost(to.to_string()));
        }
        if let Some(record) = inner.hosts.get_mut(from) {
            record.workers.remove(worker_id);
        }
        if let Some(record) = inner.hosts.get_mut(to) {
            record.workers.insert(worker_id.to_string());
        }
        inner
            .worker_hosts
            .insert(worker_id.to_string(), to.to_string());
        info!(worker = worker_id, from, to, "Worker migrated");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<HostRecord> {
        self.inner.read().hosts.get(id).cloned()
    }

    /// Every host, ordered by id.
    pub fn get_all(&self) -> Vec<HostRecord> {
        self.inner.read().hosts.values().cloned().collect()
    }

    pub fn get_by_status(&self, status: HostStatus) -> Vec<HostRecord> {
        self.inner
            .read()
            .hosts
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn host_of_worker(&self, worker_id: &str) -> Option<String> {
        self.inner.read().worker_hosts.get(worker_id).cloned()
    }

    /// The project id cached at bind time.
    pub fn project_of_worker(&self, worker_id: &str) -> Option<String> {
        self.inner
            .read()
            .worker_projects
            .get(worker_id)
            .cloned()
            .flatten()
    }

    /// Mark active hosts with no successful ping for longer than
    /// `stale_after` as stale. A host that has never been pinged is
    /// measured from registration. Returns the ids that were marked.
    pub fn cleanup_stale(&self, stale_after: Duration) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut marked = Vec::new();
        for record in inner.hosts.values_mut() {
            if record.status != HostStatus::Active {
                continue;
            }
            let anchor = record.heartbeat_at.unwrap_or(record.registered_at);
            if anchor.elapsed() > stale_after {
                record.status = HostStatus::Stale;
                warn!(
                    host = %record.id,
                    idle_secs = anchor.elapsed().as_secs(),
                    "Host marked stale"
                );
                marked.push(record.id.clone());
            }
        }
        marked
    }

    /// Test hook: pin a host's health score directly.
    #[cfg(test)]
    pub fn force_health(&self, id: &str, score: i64) {
        if let Some(record) = self.inner.write().hosts.get_mut(id) {
            record.health_score = score;
        }
    }

    pub fn stats(&self) -> FleetStats {
        let inner = self.inner.read();
        let mut stats = FleetStats {
            total: inner.hosts.len(),
            workers: inner.worker_hosts.len(),
            ..Default::default()
        };
        for record in inner.hosts.values() {
            match record.status {
                HostStatus::Active => stats.active += 1,
                HostStatus::Stale => stats.stale += 1,
                HostStatus::Error => stats.error += 1,
                HostStatus::Terminated => stats.terminated += 1,
            }
        }
        stats
    }
}

impl HostErrorSink for HostRegistry {
    fn host_error(&self, host_id: &str, message: &str) {
        self.mark_error(host_id, message);
    }
}
