//! Fleet supervisor
//!
//! Owns the heartbeat loop and wires the control-plane pieces
//! together. Start and stop are idempotent; the manual entry points
//! (`heal_orphans`, `redistribute`, `reset_circuit`) mirror what the
//! loop does automatically and return the same result shapes.

mod heartbeat;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::EventSink;
use crate::heal::{HealReport, OrphanReaper};
use crate::metrics::metrics;
use crate::notify::Notifier;
use crate::placement::{HostSelector, Selection};
use crate::redistribute::{RedistributionReport, Redistributor};
use crate::registry::{FleetStats, HostOpts, HostRegistry};
use crate::rpc::{CircuitBreaker, CircuitSnapshot, Pinger};
use crate::workers::WorkerStore;

/// Point-in-time view of the supervisor for status output.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub running: bool,
    pub ticks: u64,
    pub cleanups: u64,
    pub fleet: FleetStats,
    pub circuit: CircuitSnapshot,
}

/// Result of one cleanup pass: stale marking, healing, redistribution,
/// in that order.
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub stale_hosts: Vec<String>,
    pub heal: HealReport,
    pub redistribution: RedistributionReport,
}

/// Drives the heartbeat loop and exposes the fleet-control operations.
pub struct Supervisor {
    config: Config,
    registry: Arc<HostRegistry>,
    pinger: Arc<dyn Pinger>,
    breaker: Arc<CircuitBreaker>,
    selector: HostSelector,
    reaper: OrphanReaper,
    redistributor: Redistributor,
    default_host_id: String,
    running: AtomicBool,
    ticks: AtomicU64,
    cleanups: AtomicU64,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        registry: Arc<HostRegistry>,
        workers: Arc<dyn WorkerStore>,
        pinger: Arc<dyn Pinger>,
        breaker: Arc<CircuitBreaker>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let default_host_id = config.rpc.default_host_id();
        let selector = HostSelector::new(config.placement.clone(), default_host_id.clone());

        // Make sure the fleet is never empty at boot: the default host
        // exists before the first tick.
        registry.register(
            &default_host_id,
            HostOpts {
                socket_name: config.rpc.socket_name.clone(),
            },
        );

        let reaper = OrphanReaper::new(
            registry.clone(),
            workers.clone(),
            selector.clone(),
            events.clone(),
            notifier,
        );
        let redistributor = Redistributor::new(
            registry.clone(),
            workers,
            selector.clone(),
            events,
            config.redistribution.clone(),
        );

        Self {
            config,
            registry,
            pinger,
            breaker,
            selector,
            reaper,
            redistributor,
            default_host_id,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        }
    }

    /// Start the heartbeat loop. A no-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Heartbeat loop already running");
            return;
        }
        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let supervisor = self.clone();
        tokio::spawn(heartbeat::run_loop(supervisor, token));
        info!(
            interval_ms = self.config.heartbeat.interval_ms,
            cleanup_interval_ms = self.config.heartbeat.cleanup_interval_ms,
            "Heartbeat loop started"
        );
    }

    /// Stop the heartbeat loop cooperatively. A no-op when not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Heartbeat loop not running");
            return;
        }
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        info!("Heartbeat loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.is_running(),
            ticks: self.ticks.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            fleet: self.registry.stats(),
            circuit: self.breaker.snapshot(),
        }
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// Pick a host for a new worker and bind it there. The returned
    /// selection carries the reason and the scoring table; on fallback
    /// the worker still lands on the default host.
    pub fn place_worker(&self, worker_id: &str, project_id: Option<&str>) -> Selection {
        let selection = self.selector.select(&self.registry, project_id);
        if let Err(e) = self.registry.bind(&selection.host_id, worker_id, project_id) {
            warn!(
                worker = worker_id,
                host = %selection.host_id,
                error = %e,
                "Failed to bind placed worker"
            );
        }
        selection
    }

    /// One heartbeat pass: ping every active host (or the default host
    /// when none are active) and fold the results into the registry.
    pub async fn tick(&self) {
        let mut targets: Vec<(String, Option<String>)> = self
            .registry
            .get_by_status(crate::registry::HostStatus::Active)
            .into_iter()
            .map(|h| (h.id, h.opts.socket_name))
            .collect();

        // Bootstrap fallback: with nothing active, ping the default
        // host; a success revives it.
        if targets.is_empty() {
            targets.push((
                self.default_host_id.clone(),
                self.config.rpc.socket_name.clone(),
            ));
        }

        let timeout_ms = self.config.heartbeat.ping_timeout_ms;
        let pings = targets.into_iter().map(|(id, socket)| async move {
            let result = self.pinger.ping(&id, socket.as_deref(), timeout_ms).await;
            (id, result)
        });

        for (id, result) in futures::future::join_all(pings).await {
            match result {
                Ok(ok) => {
                    self.registry.heartbeat_success(&id, ok.elapsed_ms);
                    metrics().record_heartbeat("success");
                    metrics().observe_ping(&id, ok.elapsed_ms as f64 / 1_000.0);
                }
                Err(crate::rpc::EvalError::CircuitOpen) => {
                    debug!(host = %id, "Heartbeat skipped, circuit open");
                    metrics().record_heartbeat("skipped");
                }
                Err(e) => {
                    self.registry.heartbeat_failure(&id, &e.to_string());
                    metrics().record_heartbeat("failure");
                }
            }
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        metrics().set_fleet(&self.registry.stats());
        let circuit = self.breaker.snapshot();
        metrics().set_circuit(circuit.state, circuit.crash_count);
    }

    /// One cleanup pass: mark stale hosts, heal orphans, rebalance.
    pub fn cleanup(&self) -> CleanupReport {
        let stale_hosts = self
            .registry
            .cleanup_stale(Duration::from_millis(self.config.heartbeat.stale_after_ms));
        if !stale_hosts.is_empty() {
            warn!(hosts = ?stale_hosts, "Hosts marked stale");
        }

        let heal = self.reaper.heal();
        for result in &heal.results {
            metrics().record_orphan(result.action.as_str());
        }

        let redistribution = self.redistributor.run();
        for result in &redistribution.results {
            metrics().record_migration(if result.success { "executed" } else { "failed" });
        }

        self.cleanups.fetch_add(1, Ordering::Relaxed);
        metrics().set_fleet(&self.registry.stats());

        CleanupReport {
            stale_hosts,
            heal,
            redistribution,
        }
    }

    /// Manual healing pass; same shape as the automatic one.
    pub fn heal_orphans(&self) -> HealReport {
        self.reaper.heal()
    }

    /// Manual redistribution pass; same shape as the automatic one.
    pub fn redistribute(&self) -> RedistributionReport {
        self.redistributor.run()
    }

    /// Ops escape hatch: force the circuit closed.
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::events::NullSink;
    use crate::notify::NullNotifier;
    use crate::registry::HostStatus;
    use crate::rpc::{EvalError, EvalOk};
    use crate::workers::{MemoryWorkerStore, WorkerStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Scripted pinger: per-host canned behavior.
    #[derive(Clone, Copy)]
    enum PingScript {
        Ok(u64),
        Dead,
        Open,
    }

    struct FakePinger {
        scripts: parking_lot::RwLock<HashMap<String, PingScript>>,
    }

    impl FakePinger {
        fn new() -> Self {
            Self {
                scripts: parking_lot::RwLock::new(HashMap::new()),
            }
        }

        fn script(&self, host: &str, script: PingScript) {
            self.scripts.write().insert(host.to_string(), script);
        }
    }

    #[async_trait]
    impl Pinger for FakePinger {
        async fn ping(
            &self,
            host_id: &str,
            _socket: Option<&str>,
            _timeout_ms: u64,
        ) -> Result<EvalOk, EvalError> {
            match self.scripts.read().get(host_id).copied() {
                Some(PingScript::Ok(elapsed_ms)) => Ok(EvalOk {
                    output: "t".to_string(),
                    elapsed_ms,
                }),
                Some(PingScript::Open) => Err(EvalError::CircuitOpen),
                _ => Err(EvalError::Exception {
                    message: "unscripted host".to_string(),
                    elapsed_ms: 0,
                }),
            }
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        registry: Arc<HostRegistry>,
        store: Arc<MemoryWorkerStore>,
        pinger: Arc<FakePinger>,
    }

    fn fixture(config: Config) -> Fixture {
        let registry = Arc::new(HostRegistry::new());
        let store = Arc::new(MemoryWorkerStore::new());
        let pinger = Arc::new(FakePinger::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let supervisor = Arc::new(Supervisor::new(
            config,
            registry.clone(),
            store.clone(),
            pinger.clone(),
            breaker,
            Arc::new(NullSink),
            Arc::new(NullNotifier),
        ));
        Fixture {
            supervisor,
            registry,
            store,
            pinger,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        // Pin the default host id regardless of the test environment.
        config.rpc.socket_name = Some("server".to_string());
        config.heartbeat.interval_ms = 10;
        config.heartbeat.cleanup_interval_ms = 50;
        config
    }

    #[test]
    fn default_host_is_registered_at_boot() {
        let f = fixture(test_config());
        assert!(f.registry.get("server").is_some());
        assert_eq!(f.supervisor.status().fleet.total, 1);
    }

    #[tokio::test]
    async fn tick_pings_every_active_host() {
        let f = fixture(test_config());
        f.registry.register("h1", HostOpts::default());
        f.registry.register("h2", HostOpts::default());
        f.pinger.script("server", PingScript::Ok(50));
        f.pinger.script("h1", PingScript::Ok(100));
        f.pinger.script("h2", PingScript::Dead);

        f.supervisor.tick().await;

        assert!(f.registry.get("h1").unwrap().heartbeat_at.is_some());
        assert_eq!(f.registry.get("h1").unwrap().health_score, 100);
        let h2 = f.registry.get("h2").unwrap();
        assert_eq!(h2.error_count, 1);
        assert_eq!(h2.status, HostStatus::Active);
        assert_eq!(f.supervisor.status().ticks, 1);
    }

    #[tokio::test]
    async fn three_failed_ticks_mark_host_errored() {
        let f = fixture(test_config());
        f.registry.register("h1", HostOpts::default());
        f.pinger.script("server", PingScript::Ok(50));
        f.pinger.script("h1", PingScript::Dead);

        for _ in 0..3 {
            f.supervisor.tick().await;
        }

        let h1 = f.registry.get("h1").unwrap();
        assert_eq!(h1.status, HostStatus::Error);
        assert_eq!(h1.error_count, 3);
    }

    #[tokio::test]
    async fn circuit_open_skips_without_recording_failure() {
        let f = fixture(test_config());
        f.pinger.script("server", PingScript::Open);

        f.supervisor.tick().await;

        let host = f.registry.get("server").unwrap();
        assert_eq!(host.error_count, 0);
        assert!(host.heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn fallback_ping_revives_an_errored_default_host() {
        let f = fixture(test_config());
        f.registry.mark_error("server", "gone");
        assert!(f
            .registry
            .get_by_status(HostStatus::Active)
            .is_empty());

        f.pinger.script("server", PingScript::Ok(40));
        f.supervisor.tick().await;

        assert_eq!(f.registry.get("server").unwrap().status, HostStatus::Active);
    }

    #[tokio::test]
    async fn cleanup_runs_stale_heal_redistribute_in_order() {
        let mut config = test_config();
        config.heartbeat.stale_after_ms = 5;
        let f = fixture(config);

        f.registry.register("h_dead", HostOpts::default());
        f.registry.register("h_live", HostOpts::default());
        f.store.insert_worker("w1", WorkerStatus::Idle, None);
        f.registry.bind("h_dead", "w1", None).unwrap();

        // Only the live host has been heard from recently.
        std::thread::sleep(Duration::from_millis(20));
        f.registry.heartbeat_success("h_live", 30);
        f.registry.heartbeat_success("server", 30);

        let report = f.supervisor.cleanup();

        assert_eq!(report.stale_hosts, vec!["h_dead".to_string()]);
        assert_eq!(report.heal.orphans_found, 1);
        assert_eq!(report.heal.healed, 1);
        // The orphan ended up on a live host in the same pass.
        let new_host = f.registry.host_of_worker("w1").unwrap();
        assert_ne!(new_host, "h_dead");
        assert_eq!(f.supervisor.status().cleanups, 1);
    }

    #[tokio::test]
    async fn place_worker_binds_to_the_selected_host() {
        let f = fixture(test_config());
        f.registry.register("h1", HostOpts::default());
        f.registry.force_health("server", 50);

        let selection = f.supervisor.place_worker("w1", Some("proj"));
        assert!(selection.is_selected());
        assert_eq!(selection.host_id, "h1");
        assert_eq!(f.registry.host_of_worker("w1").as_deref(), Some("h1"));
        assert_eq!(f.registry.project_of_worker("w1").as_deref(), Some("proj"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let f = fixture(test_config());
        f.pinger.script("server", PingScript::Ok(10));

        f.supervisor.start();
        f.supervisor.start();
        assert!(f.supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let ticks_while_running = f.supervisor.status().ticks;
        assert!(ticks_while_running > 0);

        f.supervisor.stop();
        f.supervisor.stop();
        assert!(!f.supervisor.is_running());

        // The loop has exited; the tick counter stops moving.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = f.supervisor.status().ticks;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.supervisor.status().ticks, settled);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_resumes_ticking() {
        let f = fixture(test_config());
        f.pinger.script("server", PingScript::Ok(10));

        f.supervisor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.supervisor.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = f.supervisor.status().ticks;

        f.supervisor.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.supervisor.status().ticks > before);
        f.supervisor.stop();
    }

    #[tokio::test]
    async fn manual_entry_points_mirror_automatic_ones() {
        let f = fixture(test_config());

        let heal = f.supervisor.heal_orphans();
        assert_eq!(heal.orphans_found, 0);

        let redistribution = f.supervisor.redistribute();
        assert_eq!(redistribution.planned, 0);

        f.supervisor.reset_circuit();
        assert_eq!(
            f.supervisor.status().circuit.state,
            crate::rpc::CircuitState::Closed
        );
    }
}
