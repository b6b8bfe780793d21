//! Supervisor lifecycle against a scripted pinger

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use argus::config::Config;
use argus::events::MemorySink;
use argus::notify::NullNotifier;
use argus::registry::{HostOpts, HostRegistry, HostStatus};
use argus::rpc::{CircuitBreaker, EvalError, EvalOk, Pinger};
use argus::supervisor::Supervisor;
use argus::workers::{MemoryWorkerStore, WorkerStatus, WorkerStore};

/// Pinger whose set of "down" hosts can be flipped mid-test.
#[derive(Default)]
struct SwitchablePinger {
    down: RwLock<HashSet<String>>,
}

impl SwitchablePinger {
    fn set_down(&self, host: &str, down: bool) {
        if down {
            self.down.write().insert(host.to_string());
        } else {
            self.down.write().remove(host);
        }
    }
}

#[async_trait]
impl Pinger for SwitchablePinger {
    async fn ping(
        &self,
        host_id: &str,
        _socket: Option<&str>,
        _timeout_ms: u64,
    ) -> Result<EvalOk, EvalError> {
        if self.down.read().contains(host_id) {
            Err(EvalError::Exception {
                message: "server did not respond".to_string(),
                elapsed_ms: 10,
            })
        } else {
            Ok(EvalOk {
                output: "t".to_string(),
                elapsed_ms: 25,
            })
        }
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    registry: Arc<HostRegistry>,
    store: Arc<MemoryWorkerStore>,
    pinger: Arc<SwitchablePinger>,
    events: Arc<MemorySink>,
}

fn harness() -> Harness {
    let mut config = Config::default();
    config.rpc.socket_name = Some("server".to_string());
    config.heartbeat.stale_after_ms = 60_000;

    let registry = Arc::new(HostRegistry::with_failure_threshold(
        config.heartbeat.failure_threshold,
    ));
    let store = Arc::new(MemoryWorkerStore::new());
    let pinger = Arc::new(SwitchablePinger::default());
    let events = Arc::new(MemorySink::new());
    let breaker = Arc::new(CircuitBreaker::new(config.rpc.breaker.clone()));

    let supervisor = Arc::new(Supervisor::new(
        config,
        registry.clone(),
        store.clone(),
        pinger.clone(),
        breaker,
        events.clone(),
        Arc::new(NullNotifier),
    ));

    Harness {
        supervisor,
        registry,
        store,
        pinger,
        events,
    }
}

#[tokio::test]
async fn host_death_orphans_are_healed_end_to_end() {
    let h = harness();
    h.registry.register("h1", HostOpts::default());

    // A healthy fleet carries some workers on h1.
    h.store.insert_worker("w-idle", WorkerStatus::Idle, Some("proj"));
    h.store.insert_worker("w-busy", WorkerStatus::Working, None);
    h.supervisor.tick().await;
    h.registry.bind("h1", "w-idle", Some("proj")).unwrap();
    h.registry.bind("h1", "w-busy", None).unwrap();

    // h1 goes dark: three failed heartbeats mark it errored.
    h.pinger.set_down("h1", true);
    for _ in 0..3 {
        h.supervisor.tick().await;
    }
    assert_eq!(h.registry.get("h1").unwrap().status, HostStatus::Error);

    // The cleanup pass heals both orphans: the idle worker moves to
    // the default host, the working one is torn down.
    let report = h.supervisor.cleanup();
    assert_eq!(report.heal.orphans_found, 2);
    assert_eq!(report.heal.failed, 0);

    assert_eq!(h.registry.host_of_worker("w-idle").as_deref(), Some("server"));
    assert!(h.registry.host_of_worker("w-busy").is_none());
    assert_eq!(
        h.store.get("w-busy").unwrap().status,
        WorkerStatus::Terminated
    );

    let events = h.events.take();
    assert!(events.iter().any(|(name, _)| name == "orphans_healed"));

    // The host comes back and rejoins the fleet on the next tick.
    h.pinger.set_down("h1", false);
    h.supervisor.tick().await;
    assert_eq!(h.registry.get("h1").unwrap().status, HostStatus::Active);
}

#[tokio::test]
async fn repeated_cleanup_converges_to_a_quiet_fleet() {
    let h = harness();
    h.registry.register("h1", HostOpts::default());
    h.store.insert_worker("w1", WorkerStatus::Idle, None);
    h.supervisor.tick().await;
    h.registry.bind("h1", "w1", None).unwrap();

    h.pinger.set_down("h1", true);
    for _ in 0..3 {
        h.supervisor.tick().await;
    }

    let first = h.supervisor.cleanup();
    assert_eq!(first.heal.orphans_found, 1);

    // Nothing left to do on the second pass.
    let second = h.supervisor.cleanup();
    assert_eq!(second.heal.orphans_found, 0);
    assert_eq!(second.redistribution.planned, 0);
}

#[tokio::test]
async fn status_reflects_fleet_and_circuit() {
    let h = harness();
    h.registry.register("h1", HostOpts::default());
    h.supervisor.tick().await;

    let status = h.supervisor.status();
    assert!(!status.running);
    assert_eq!(status.ticks, 1);
    assert_eq!(status.fleet.total, 2);
    assert_eq!(status.fleet.active, 2);
    assert_eq!(status.circuit.crash_count, 0);
}
