//! Host selection for new worker spawns
//!
//! Scores every host on health, spare capacity, and project affinity,
//! then picks the best qualified one. Falls back to the default host
//! when the fleet is empty or nothing qualifies, so callers always get
//! a target and a reason.

use tracing::debug;

use crate::config::PlacementConfig;
use crate::registry::{HostRecord, HostRegistry, HostStatus};

/// Capacity bonus per free worker slot.
const CAPACITY_BONUS_PER_SLOT: i64 = 10;

/// Affinity bonus when a host already runs several workers of the
/// same project.
const AFFINITY_STRONG_BONUS: i64 = 10;
const AFFINITY_STRONG_COUNT: usize = 3;
const AFFINITY_WEAK_BONUS: i64 = 5;

/// Why a host was excluded from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisqualifyReason {
    NotActive,
    AtCapacity,
    Unhealthy,
}

impl DisqualifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotActive => "not_active",
            Self::AtCapacity => "at_capacity",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// A host's score, or the reason it was disqualified (score -1).
#[derive(Debug, Clone)]
pub struct ScoredHost {
    pub host_id: String,
    pub score: i64,
    pub disqualified: Option<DisqualifyReason>,
}

/// How the selection concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// The best qualified host was chosen.
    Selected,
    /// No hosts are registered; the default host is returned.
    NoHosts,
    /// Every host was disqualified; the default host is returned.
    AllDisqualified,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::NoHosts => "no_hosts",
            Self::AllDisqualified => "all_disqualified",
        }
    }
}

/// Result of a selection, with the full scoring table for diagnostics.
#[derive(Debug, Clone)]
pub struct Selection {
    pub host_id: String,
    pub reason: SelectionReason,
    pub scored: Vec<ScoredHost>,
}

impl Selection {
    pub fn is_selected(&self) -> bool {
        self.reason == SelectionReason::Selected
    }

    /// Score of the chosen host, when one was chosen.
    pub fn selected_score(&self) -> Option<i64> {
        if !self.is_selected() {
            return None;
        }
        self.scored
            .iter()
            .find(|s| s.host_id == self.host_id)
            .map(|s| s.score)
    }
}

/// Scores and ranks hosts for worker placement.
#[derive(Clone)]
pub struct HostSelector {
    config: PlacementConfig,
    default_host_id: String,
}

impl HostSelector {
    pub fn new(config: PlacementConfig, default_host_id: String) -> Self {
        Self {
            config,
            default_host_id,
        }
    }

    /// Score one host for a prospective worker of `project_id`.
    pub fn score_host(
        &self,
        host: &HostRecord,
        project_id: Option<&str>,
        registry: &HostRegistry,
    ) -> ScoredHost {
        let disqualified = if host.status != HostStatus::Active {
            Some(DisqualifyReason::NotActive)
        } else if host.worker_count() >= self.config.max_workers_per_host {
            Some(DisqualifyReason::AtCapacity)
        } else if host.health_level() == crate::health::HealthLevel::Unhealthy {
            Some(DisqualifyReason::Unhealthy)
        } else {
            None
        };

        if let Some(reason) = disqualified {
            return ScoredHost {
                host_id: host.id.clone(),
                score: -1,
                disqualified: Some(reason),
            };
        }

        let spare = self.config.max_workers_per_host as i64 - host.worker_count() as i64;
        let score = host.health_score
            + spare * CAPACITY_BONUS_PER_SLOT
            + self.affinity_bonus(host, project_id, registry);

        ScoredHost {
            host_id: host.id.clone(),
            score,
            disqualified: None,
        }
    }

    fn affinity_bonus(
        &self,
        host: &HostRecord,
        project_id: Option<&str>,
        registry: &HostRegistry,
    ) -> i64 {
        let Some(project) = project_id else {
            return 0;
        };
        let matching = host
            .workers
            .iter()
            .filter(|w| registry.project_of_worker(w).as_deref() == Some(project))
            .count();
        if matching >= AFFINITY_STRONG_COUNT {
            AFFINITY_STRONG_BONUS
        } else if matching >= 1 {
            AFFINITY_WEAK_BONUS
        } else {
            0
        }
    }

    /// Pick the best host for a new worker.
    pub fn select(&self, registry: &HostRegistry, project_id: Option<&str>) -> Selection {
        self.select_excluding(registry, project_id, None)
    }

    /// Pick the best host, optionally leaving one out of consideration
    /// (used when sizing up migration targets).
    pub fn select_excluding(
        &self,
        registry: &HostRegistry,
        project_id: Option<&str>,
        exclude: Option<&str>,
    ) -> Selection {
        let hosts: Vec<HostRecord> = registry
            .get_all()
            .into_iter()
            .filter(|h| Some(h.id.as_str()) != exclude)
            .collect();

        if hosts.is_empty() {
            return Selection {
                host_id: self.default_host_id.clone(),
                reason: SelectionReason::NoHosts,
                scored: Vec::new(),
            };
        }

        let scored: Vec<ScoredHost> = hosts
            .iter()
            .map(|h| self.score_host(h, project_id, registry))
            .collect();

        // Hosts arrive sorted by id, so keeping the first strict
        // maximum makes ties deterministic.
        let mut best: Option<&ScoredHost> = None;
        for candidate in scored.iter().filter(|s| s.disqualified.is_none()) {
            if best.map(|b| candidate.score > b.score).unwrap_or(true) {
                best = Some(candidate);
            }
        }

        match best {
            Some(winner) => {
                debug!(
                    host = %winner.host_id,
                    score = winner.score,
                    candidates = scored.len(),
                    "Host selected"
                );
                Selection {
                    host_id: winner.host_id.clone(),
                    reason: SelectionReason::Selected,
                    scored,
                }
            }
            None => Selection {
                host_id: self.default_host_id.clone(),
                reason: SelectionReason::AllDisqualified,
                scored,
            },
        }
    }
}
