//! RPC client against stub editor-client binaries

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use argus::config::{BreakerConfig, RpcConfig};
use argus::rpc::{CircuitBreaker, CircuitState, DeathTag, EvalError, HostErrorSink, RpcClient};

use crate::stub_client;

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(String, String)>>,
}

impl HostErrorSink for RecordingSink {
    fn host_error(&self, host_id: &str, message: &str) {
        self.reports
            .lock()
            .push((host_id.to_string(), message.to_string()));
    }
}

fn client_for(bin: &str, initial_backoff_ms: u64) -> (RpcClient, Arc<CircuitBreaker>, Arc<RecordingSink>) {
    let config = RpcConfig {
        client_bin: bin.to_string(),
        socket_name: None,
        max_timeout_ms: 30_000,
        breaker: BreakerConfig {
            initial_backoff_ms,
            max_backoff_ms: 60_000,
        },
    };
    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let sink = Arc::new(RecordingSink::default());
    let client = RpcClient::new(config, breaker.clone(), sink.clone());
    (client, breaker, sink)
}

#[tokio::test]
async fn eval_trims_and_strips_one_quote_layer() {
    let dir = tempfile::tempdir().unwrap();
    let bin = stub_client(&dir, "ok-client", r#"echo '"pong"'"#);
    let (client, breaker, _) = client_for(&bin, 1_000);

    let ok = client.eval("(ping)", 5_000).await.unwrap();
    assert_eq!(ok.output, "pong");
    assert!(ok.elapsed_ms < 5_000);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn unquoted_output_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let bin = stub_client(&dir, "num-client", "echo 42");
    let (client, _, _) = client_for(&bin, 1_000);

    let ok = client.eval("(+ 40 2)", 5_000).await.unwrap();
    assert_eq!(ok.output, "42");
}

#[tokio::test]
async fn host_death_trips_breaker_and_files_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let bin = stub_client(
        &dir,
        "dead-client",
        r#"echo "emacsclient: can't find socket; have you started the server?" >&2
exit 1"#,
    );
    let (client, breaker, sink) = client_for(&bin, 60_000);

    let err = client.eval("t", 5_000).await.unwrap_err();
    match err {
        EvalError::HostDead { tag, .. } => assert_eq!(tag, DeathTag::SocketNotFound),
        other => panic!("expected HostDead, got {other:?}"),
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.crash_count(), 1);

    let reports = sink.reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "server");
    assert!(reports[0].1.starts_with("[socket_not_found]"));
}

#[tokio::test]
async fn open_circuit_spawns_no_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("invocations");
    let bin = stub_client(
        &dir,
        "counting-client",
        &format!(
            r#"echo hit >> {}
echo "connect: Connection refused" >&2
exit 1"#,
            marker.display()
        ),
    );
    let (client, breaker, _) = client_for(&bin, 60_000);

    // First call spawns, fails, and trips the breaker.
    let err = client.eval("t", 5_000).await.unwrap_err();
    assert!(matches!(err, EvalError::HostDead { .. }));
    assert_eq!(breaker.state(), CircuitState::Open);

    // Subsequent calls are rejected before any spawn.
    for _ in 0..3 {
        let err = client.eval("t", 5_000).await.unwrap_err();
        assert!(matches!(err, EvalError::CircuitOpen));
    }

    let invocations = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(invocations.lines().count(), 1);
}

#[tokio::test]
async fn deadline_kills_a_hung_client() {
    let dir = tempfile::tempdir().unwrap();
    let bin = stub_client(&dir, "hung-client", "sleep 30");
    let (client, breaker, _) = client_for(&bin, 1_000);

    let started = std::time::Instant::now();
    let err = client.eval("t", 200).await.unwrap_err();
    assert!(matches!(err, EvalError::Timeout { timeout_ms: 200, .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    // A timeout outside a probe does not trip the breaker.
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn unmatched_failure_is_an_exception_and_no_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bin = stub_client(
        &dir,
        "lisp-error-client",
        r#"echo "*ERROR*: void-function my-missing-fn" >&2
exit 1"#,
    );
    let (client, breaker, sink) = client_for(&bin, 1_000);

    let err = client.eval("(my-missing-fn)", 5_000).await.unwrap_err();
    match err {
        EvalError::Exception { message, .. } => assert!(message.contains("void-function")),
        other => panic!("expected Exception, got {other:?}"),
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(sink.reports.lock().is_empty());
}

#[tokio::test]
async fn successful_probe_recovers_the_circuit() {
    let dir = tempfile::tempdir().unwrap();
    let dead = stub_client(
        &dir,
        "dead-client",
        r#"echo "connect: Connection refused" >&2
exit 1"#,
    );
    let ok = stub_client(&dir, "ok-client", r#"echo '"t"'"#);

    // Two clients sharing one breaker: the host "comes back" between
    // calls.
    let (dead_client, breaker, sink) = client_for(&dead, 20);
    let ok_config = RpcConfig {
        client_bin: ok.clone(),
        socket_name: None,
        max_timeout_ms: 30_000,
        breaker: BreakerConfig {
            initial_backoff_ms: 20,
            max_backoff_ms: 60_000,
        },
    };
    let ok_client = RpcClient::new(ok_config, breaker.clone(), sink.clone());

    let err = dead_client.eval("t", 5_000).await.unwrap_err();
    assert!(matches!(err, EvalError::HostDead { .. }));
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = ok_client.eval("t", 5_000).await.unwrap();
    assert_eq!(result.output, "t");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.crash_count(), 1);
    assert!(breaker.snapshot().recovery_at.is_some());
}
