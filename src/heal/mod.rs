//! Auto-heal for workers orphaned by dead hosts
//!
//! A worker bound to a non-active host has lost its compute. Workers
//! that were not mid-task are rebound to a healthy host; workers that
//! were working are presumed gone and torn down (their dispatched
//! tasks failed, their claims released). Either way the dead host's
//! binding is cleaned up so the next cycle starts from the truth.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::events::EventSink;
use crate::notify::{Icon, Notifier, Urgency};
use crate::placement::HostSelector;
use crate::registry::HostRegistry;
use crate::workers::{TaskStatus, WorkerStatus, WorkerStore};

/// What the reaper decided to do with an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    Rebind,
    Terminate,
    Skip,
}

impl HealAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rebind => "rebind",
            Self::Terminate => "terminate",
            Self::Skip => "skip",
        }
    }
}

/// Per-orphan outcome.
#[derive(Debug, Clone)]
pub struct HealOutcome {
    pub worker_id: String,
    pub host_id: String,
    pub action: HealAction,
    pub success: bool,
    /// New host on rebind, failure reason otherwise.
    pub detail: Option<String>,
}

/// Result of one healing pass.
#[derive(Debug, Clone, Default)]
pub struct HealReport {
    pub orphans_found: usize,
    pub healed: usize,
    pub failed: usize,
    pub results: Vec<HealOutcome>,
}

/// Detects and heals workers bound to dead hosts.
pub struct OrphanReaper {
    registry: Arc<HostRegistry>,
    workers: Arc<dyn WorkerStore>,
    selector: HostSelector,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
}

impl OrphanReaper {
    pub fn new(
        registry: Arc<HostRegistry>,
        workers: Arc<dyn WorkerStore>,
        selector: HostSelector,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            workers,
            selector,
            events,
            notifier,
        }
    }

    /// One healing pass over the current fleet snapshot.
    pub fn heal(&self) -> HealReport {
        let mut report = HealReport::default();

        for host in self.registry.get_all() {
            if !host.status.is_dead() {
                continue;
            }
            for worker_id in &host.workers {
                report.orphans_found += 1;
                let record = self.workers.get(worker_id);
                let action = classify(record.as_ref().map(|r| r.status));
                let outcome = match action {
                    HealAction::Rebind => self.rebind(&host.id, worker_id),
                    HealAction::Terminate => self.terminate(&host.id, worker_id),
                    HealAction::Skip => {
                        self.registry.unbind(&host.id, worker_id);
                        HealOutcome {
                            worker_id: worker_id.clone(),
                            host_id: host.id.clone(),
                            action,
                            success: true,
                            detail: None,
                        }
                    }
                };
                if outcome.success {
                    report.healed += 1;
                } else {
                    report.failed += 1;
                }
                report.results.push(outcome);
            }
        }

        if report.orphans_found > 0 {
            info!(
                orphans = report.orphans_found,
                healed = report.healed,
                failed = report.failed,
                "Orphaned workers healed"
            );
            self.events.emit(
                "orphans_healed",
                json!({
                    "orphans_found": report.orphans_found,
                    "healed": report.healed,
                    "failed": report.failed,
                    "results": report
                        .results
                        .iter()
                        .map(|r| json!({
                            "worker_id": r.worker_id,
                            "action": r.action.as_str(),
                            "success": r.success,
                        }))
                        .collect::<Vec<_>>(),
                }),
            );

            let terminated = report
                .results
                .iter()
                .filter(|r| r.action == HealAction::Terminate && r.success)
                .count();
            if terminated > 0 {
                self.notifier.notify(
                    "Workers terminated",
                    &format!("{terminated} worker(s) lost with their host and were terminated"),
                    Urgency::Normal,
                    Icon::Warning,
                    5_000,
                );
            }
        }

        report
    }

    /// Move a recoverable orphan to a healthy host. When no healthy
    /// host exists the binding stays put for the next cycle.
    fn rebind(&self, dead_host: &str, worker_id: &str) -> HealOutcome {
        let project = self.registry.project_of_worker(worker_id);
        let selection = self.selector.select(&self.registry, project.as_deref());

        if selection.is_selected() && selection.host_id != dead_host {
            match self.registry.migrate(worker_id, dead_host, &selection.host_id) {
                Ok(()) => HealOutcome {
                    worker_id: worker_id.to_string(),
                    host_id: dead_host.to_string(),
                    action: HealAction::Rebind,
                    success: true,
                    detail: Some(selection.host_id),
                },
                Err(e) => HealOutcome {
                    worker_id: worker_id.to_string(),
                    host_id: dead_host.to_string(),
                    action: HealAction::Rebind,
                    success: false,
                    detail: Some(e.to_string()),
                },
            }
        } else {
            warn!(
                worker = worker_id,
                host = dead_host,
                reason = selection.reason.as_str(),
                "No healthy host for orphan, leaving binding for next cycle"
            );
            HealOutcome {
                worker_id: worker_id.to_string(),
                host_id: dead_host.to_string(),
                action: HealAction::Rebind,
                success: false,
                detail: Some("no_healthy_host".to_string()),
            }
        }
    }

    /// Tear down a worker whose in-process state died with its host.
    fn terminate(&self, dead_host: &str, worker_id: &str) -> HealOutcome {
        for task in self.workers.tasks_for(worker_id, TaskStatus::Dispatched) {
            self.workers.fail_task(&task.id);
        }
        self.workers.release_claims(worker_id);
        self.registry.unbind(dead_host, worker_id);
        self.workers.set_status(worker_id, WorkerStatus::Terminated);

        HealOutcome {
            worker_id: worker_id.to_string(),
            host_id: dead_host.to_string(),
            action: HealAction::Terminate,
            success: true,
            detail: None,
        }
    }
}

/// Orphans that were not mid-task can be rebound; working ones lost
/// their in-process state and are torn down. Already-dead workers only
/// need their binding cleaned up. Anything unrecognized is torn down
/// rather than left dangling.
fn classify(status: Option<WorkerStatus>) -> HealAction {
    match status {
        Some(
            WorkerStatus::Idle
            | WorkerStatus::Initializing
            | WorkerStatus::Spawning
            | WorkerStatus::Starting,
        ) => HealAction::Rebind,
        Some(WorkerStatus::Working | WorkerStatus::Blocked) => HealAction::Terminate,
        Some(WorkerStatus::Error | WorkerStatus::Terminated) => HealAction::Skip,
        None => HealAction::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlacementConfig;
    use crate::events::MemorySink;
    use crate::notify::NullNotifier;
    use crate::registry::HostOpts;
    use crate::workers::MemoryWorkerStore;

    struct Fixture {
        registry: Arc<HostRegistry>,
        store: Arc<MemoryWorkerStore>,
        events: Arc<MemorySink>,
        reaper: OrphanReaper,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(HostRegistry::new());
        let store = Arc::new(MemoryWorkerStore::new());
        let events = Arc::new(MemorySink::new());
        let selector = HostSelector::new(PlacementConfig::default(), "server".to_string());
        let reaper = OrphanReaper::new(
            registry.clone(),
            store.clone(),
            selector,
            events.clone(),
            Arc::new(NullNotifier),
        );
        Fixture {
            registry,
            store,
            events,
            reaper,
        }
    }

    #[test]
    fn classify_covers_every_status() {
        assert_eq!(classify(Some(WorkerStatus::Idle)), HealAction::Rebind);
        assert_eq!(classify(Some(WorkerStatus::Initializing)), HealAction::Rebind);
        assert_eq!(classify(Some(WorkerStatus::Spawning)), HealAction::Rebind);
        assert_eq!(classify(Some(WorkerStatus::Starting)), HealAction::Rebind);
        assert_eq!(classify(Some(WorkerStatus::Working)), HealAction::Terminate);
        assert_eq!(classify(Some(WorkerStatus::Blocked)), HealAction::Terminate);
        assert_eq!(classify(Some(WorkerStatus::Error)), HealAction::Skip);
        assert_eq!(classify(Some(WorkerStatus::Terminated)), HealAction::Skip);
        assert_eq!(classify(None), HealAction::Terminate);
    }

    #[test]
    fn heals_a_dead_host_with_mixed_workers() {
        let f = fixture();
        f.registry.register("h_dead", HostOpts::default());
        f.registry.register("h_live", HostOpts::default());

        f.store.insert_worker("a", WorkerStatus::Idle, None);
        f.store.insert_worker("b", WorkerStatus::Working, None);
        f.store.insert_worker("c", WorkerStatus::Terminated, None);
        f.store.insert_task("t1", "b", crate::workers::TaskStatus::Dispatched);
        f.store.insert_claim("file.txt", "b", Some("t1"));
        f.store.insert_claim("dir/", "b", None);

        for w in ["a", "b", "c"] {
            f.registry.bind("h_dead", w, None).unwrap();
        }
        f.registry.mark_stale("h_dead");

        let report = f.reaper.heal();

        assert_eq!(report.orphans_found, 3);
        assert_eq!(report.failed, 0);

        // Idle worker rebinds to the live host.
        assert_eq!(f.registry.host_of_worker("a").as_deref(), Some("h_live"));

        // Working worker is torn down: tasks failed, claims gone,
        // status terminal.
        assert_eq!(
            f.store.get_task("t1").unwrap().status,
            crate::workers::TaskStatus::Error
        );
        assert!(f.store.claims_for("b").is_empty());
        assert_eq!(f.store.get("b").unwrap().status, WorkerStatus::Terminated);
        assert!(f.registry.host_of_worker("b").is_none());

        // Dead worker just gets its binding cleaned up.
        assert!(f.registry.host_of_worker("c").is_none());
        assert_eq!(f.store.get("c").unwrap().status, WorkerStatus::Terminated);

        // Dead host ends the pass empty.
        assert!(f.registry.get("h_dead").unwrap().workers.is_empty());
    }

    #[test]
    fn rebind_fails_without_a_healthy_host() {
        let f = fixture();
        f.registry.register("h_dead", HostOpts::default());
        f.store.insert_worker("a", WorkerStatus::Idle, None);
        f.registry.bind("h_dead", "a", None).unwrap();
        f.registry.mark_error("h_dead", "gone");

        let report = f.reaper.heal();

        assert_eq!(report.orphans_found, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.results[0].detail.as_deref(), Some("no_healthy_host"));
        // Binding stays for the next cycle.
        assert_eq!(f.registry.host_of_worker("a").as_deref(), Some("h_dead"));
    }

    #[test]
    fn unknown_worker_is_terminated_conservatively() {
        let f = fixture();
        f.registry.register("h_dead", HostOpts::default());
        f.registry.bind("h_dead", "ghost", None).unwrap();
        f.registry.mark_terminated("h_dead");

        let report = f.reaper.heal();

        assert_eq!(report.orphans_found, 1);
        assert_eq!(report.results[0].action, HealAction::Terminate);
        assert!(report.results[0].success);
        assert!(f.registry.host_of_worker("ghost").is_none());
    }

    #[test]
    fn rebind_carries_project_affinity() {
        let f = fixture();
        f.registry.register("h_dead", HostOpts::default());
        f.registry.register("h_x", HostOpts::default());
        f.registry.register("h_y", HostOpts::default());

        // h_y already runs a worker of the same project; affinity must
        // close the capacity gap.
        f.registry.force_health("h_x", 80);
        f.registry.force_health("h_y", 90);
        f.store.insert_worker("peer", WorkerStatus::Working, Some("proj"));
        f.registry.bind("h_y", "peer", Some("proj")).unwrap();

        f.store.insert_worker("a", WorkerStatus::Idle, Some("proj"));
        f.registry.bind("h_dead", "a", Some("proj")).unwrap();
        f.registry.mark_stale("h_dead");

        let report = f.reaper.heal();
        assert_eq!(report.healed, 1);
        assert_eq!(f.registry.host_of_worker("a").as_deref(), Some("h_y"));
    }

    #[test]
    fn emits_one_event_with_counts() {
        let f = fixture();
        f.registry.register("h_dead", HostOpts::default());
        f.registry.register("h_live", HostOpts::default());
        f.store.insert_worker("a", WorkerStatus::Idle, None);
        f.registry.bind("h_dead", "a", None).unwrap();
        f.registry.mark_stale("h_dead");

        f.reaper.heal();

        let events = f.events.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "orphans_healed");
        assert_eq!(events[0].1["orphans_found"], 1);
        assert_eq!(events[0].1["healed"], 1);
    }

    #[test]
    fn healthy_fleet_is_a_quiet_noop() {
        let f = fixture();
        f.registry.register("h1", HostOpts::default());
        f.store.insert_worker("a", WorkerStatus::Idle, None);
        f.registry.bind("h1", "a", None).unwrap();

        let report = f.reaper.heal();
        assert_eq!(report.orphans_found, 0);
        assert!(f.events.is_empty());

        // A second pass after healing everything finds nothing either.
        f.registry.mark_stale("h1");
        f.registry.register("h2", HostOpts::default());
        f.reaper.heal();
        let report = f.reaper.heal();
        assert_eq!(report.orphans_found, 0);
    }
}
