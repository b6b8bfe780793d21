//! Proactive migration of idle workers off stressed hosts
//!
//! A live host that is degraded or crowded sheds idle workers toward
//! better-scoring hosts. Working workers are never touched, plans must
//! clear an improvement threshold to be worth the churn, and each
//! cycle moves at most a couple of workers so the fleet converges
//! instead of oscillating.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::config::RedistributionConfig;
use crate::events::EventSink;
use crate::health::HealthLevel;
use crate::placement::HostSelector;
use crate::registry::{HostRecord, HostRegistry, HostStatus};
use crate::workers::{WorkerStatus, WorkerStore};

/// A planned migration, sized by its score improvement.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub worker_id: String,
    pub source: String,
    pub target: String,
    pub improvement: i64,
}

/// Outcome of executing one plan.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub worker_id: String,
    pub source: String,
    pub target: String,
    pub success: bool,
    pub reason: Option<String>,
}

/// Result of one redistribution cycle.
#[derive(Debug, Clone, Default)]
pub struct RedistributionReport {
    pub planned: usize,
    pub executed: usize,
    pub failed: usize,
    pub results: Vec<MigrationOutcome>,
}

/// Plans and executes idle-worker migrations.
pub struct Redistributor {
    registry: Arc<HostRegistry>,
    workers: Arc<dyn WorkerStore>,
    selector: HostSelector,
    events: Arc<dyn EventSink>,
    config: RedistributionConfig,
}

impl Redistributor {
    pub fn new(
        registry: Arc<HostRegistry>,
        workers: Arc<dyn WorkerStore>,
        selector: HostSelector,
        events: Arc<dyn EventSink>,
        config: RedistributionConfig,
    ) -> Self {
        Self {
            registry,
            workers,
            selector,
            events,
            config,
        }
    }

    /// One full cycle: plan, then execute.
    pub fn run(&self) -> RedistributionReport {
        let plans = self.plan();
        let report = self.execute(plans);

        if report.planned > 0 {
            info!(
                planned = report.planned,
                executed = report.executed,
                failed = report.failed,
                "Workers redistributed"
            );
            self.events.emit(
                "workers_redistributed",
                json!({
                    "planned": report.planned,
                    "executed": report.executed,
                    "failed": report.failed,
                    "results": report
                        .results
                        .iter()
                        .map(|r| json!({
                            "worker_id": r.worker_id,
                            "source": r.source,
                            "target": r.target,
                            "success": r.success,
                            "reason": r.reason,
                        }))
                        .collect::<Vec<_>>(),
                }),
            );
        } else {
            debug!("Fleet balanced, no migrations planned");
        }

        report
    }

    /// Build the migration plan for the current snapshot: idle workers
    /// on overloaded hosts, best improvement first, capped per cycle.
    pub fn plan(&self) -> Vec<MigrationPlan> {
        let mut plans = Vec::new();

        for source in self.registry.get_all() {
            if !self.is_overloaded(&source) {
                continue;
            }
            let source_score = self.selector.score_host(&source, None, &self.registry).score;

            for worker_id in &source.workers {
                let idle = self
                    .workers
                    .get(worker_id)
                    .map(|r| r.status == WorkerStatus::Idle)
                    .unwrap_or(false);
                if !idle {
                    continue;
                }

                let project = self.registry.project_of_worker(worker_id);
                let target =
                    self.selector
                        .select_excluding(&self.registry, project.as_deref(), Some(&source.id));
                let Some(target_score) = target.selected_score() else {
                    continue;
                };

                let improvement = target_score - source_score.max(0);
                if improvement >= self.config.improvement_threshold {
                    plans.push(MigrationPlan {
                        worker_id: worker_id.clone(),
                        source: source.id.clone(),
                        target: target.host_id,
                        improvement,
                    });
                }
            }
        }

        plans.sort_by(|a, b| {
            b.improvement
                .cmp(&a.improvement)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        plans.truncate(self.config.max_migrations_per_cycle);
        plans
    }

    /// Execute plans with race guards: a worker that stopped being
    /// idle, or vanished entirely, is skipped this cycle.
    pub fn execute(&self, plans: Vec<MigrationPlan>) -> RedistributionReport {
        let mut report = RedistributionReport {
            planned: plans.len(),
            ..Default::default()
        };

        for plan in plans {
            let outcome = match self.workers.get(&plan.worker_id) {
                None => MigrationOutcome {
                    worker_id: plan.worker_id,
                    source: plan.source,
                    target: plan.target,
                    success: false,
                    reason: Some("worker_not_found".to_string()),
                },
                Some(record) if record.status != WorkerStatus::Idle => MigrationOutcome {
                    worker_id: plan.worker_id,
                    source: plan.source,
                    target: plan.target,
                    success: false,
                    reason: Some("no_longer_idle".to_string()),
                },
                Some(_) => match self
                    .registry
                    .migrate(&plan.worker_id, &plan.source, &plan.target)
                {
                    Ok(()) => MigrationOutcome {
                        worker_id: plan.worker_id,
                        source: plan.source,
                        target: plan.target,
                        success: true,
                        reason: None,
                    },
                    Err(e) => MigrationOutcome {
                        worker_id: plan.worker_id,
                        source: plan.source,
                        target: plan.target,
                        success: false,
                        reason: Some(e.to_string()),
                    },
                },
            };

            if outcome.success {
                report.executed += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(outcome);
        }

        report
    }

    /// Overloaded: live, hosting at least one worker, and either
    /// degraded or crowded. Unhealthy hosts are the reaper's problem,
    /// not a migration source.
    fn is_overloaded(&self, host: &HostRecord) -> bool {
        host.status == HostStatus::Active
            && host.worker_count() >= 1
            && (host.health_level() == HealthLevel::Degraded
                || host.worker_count() >= self.config.overloaded_worker_count)
    }
}
