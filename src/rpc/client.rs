//! Editor-client subprocess RPC
//!
//! Each eval spawns a short-lived client process against a host's named
//! socket. The circuit breaker is consulted before anything is spawned;
//! that guard is the only thing standing between a dead host and an
//! unbounded pile of subprocesses.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use tokio::process::Command;
use tracing::debug;

use crate::config::RpcConfig;

use super::breaker::{Admission, CircuitBreaker};

/// Tag describing how a host was determined to be dead, derived from
/// the client's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathTag {
    SocketNotFound,
    SocketMissing,
    ConnectionRefused,
    ConnectionReset,
    ServerUnresponsive,
    SocketUnavailable,
}

impl DeathTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketNotFound => "socket_not_found",
            Self::SocketMissing => "socket_missing",
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectionReset => "connection_reset",
            Self::ServerUnresponsive => "server_unresponsive",
            Self::SocketUnavailable => "socket_unavailable",
        }
    }
}

impl std::fmt::Display for DeathTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful eval result.
#[derive(Debug, Clone)]
pub struct EvalOk {
    /// Trimmed stdout with one layer of surrounding quotes removed.
    pub output: String,
    pub elapsed_ms: u64,
}

/// Failed eval result.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("circuit open, host presumed dead")]
    CircuitOpen,
    #[error("eval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, elapsed_ms: u64 },
    #[error("host dead ({tag}): {message}")]
    HostDead {
        tag: DeathTag,
        message: String,
        elapsed_ms: u64,
    },
    #[error("eval failed: {message}")]
    Exception { message: String, elapsed_ms: u64 },
}

impl EvalError {
    pub fn elapsed_ms(&self) -> u64 {
        match self {
            Self::CircuitOpen => 0,
            Self::Timeout { elapsed_ms, .. }
            | Self::HostDead { elapsed_ms, .. }
            | Self::Exception { elapsed_ms, .. } => *elapsed_ms,
        }
    }
}

/// Sink for host-death reports, injected at construction.
pub trait HostErrorSink: Send + Sync {
    fn host_error(&self, host_id: &str, message: &str);
}

/// RPC client for the editor-client subprocess, guarded by the circuit
/// breaker.
pub struct RpcClient {
    config: RpcConfig,
    breaker: Arc<CircuitBreaker>,
    error_sink: Arc<dyn HostErrorSink>,
    death_patterns: Vec<(Regex, DeathTag)>,
}

impl RpcClient {
    pub fn new(
        config: RpcConfig,
        breaker: Arc<CircuitBreaker>,
        error_sink: Arc<dyn HostErrorSink>,
    ) -> Self {
        Self {
            config,
            breaker,
            error_sink,
            death_patterns: death_patterns(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Evaluate on the default host.
    pub async fn eval(&self, code: &str, timeout_ms: u64) -> Result<EvalOk, EvalError> {
        let host_id = self.config.default_host_id();
        self.eval_on(&host_id, self.config.socket_name.as_deref(), code, timeout_ms)
            .await
    }

    /// Evaluate on a specific host. `socket` is the host's socket name;
    /// `None` invokes the client without `-s`.
    pub async fn eval_on(
        &self,
        host_id: &str,
        socket: Option<&str>,
        code: &str,
        timeout_ms: u64,
    ) -> Result<EvalOk, EvalError> {
        let timeout_ms = timeout_ms.min(self.config.max_timeout_ms);

        let probing = match self.breaker.admit() {
            Admission::Blocked => return Err(EvalError::CircuitOpen),
            Admission::Probe => true,
            Admission::Proceed => false,
        };

        let result = self.spawn_and_classify(socket, code, timeout_ms).await;

        match &result {
            Ok(ok) => {
                debug!(host = host_id, elapsed_ms = ok.elapsed_ms, "Eval succeeded");
                self.breaker.on_success(probing);
            }
            Err(EvalError::HostDead { tag, message, .. }) => {
                self.breaker.trip(message, Some(tag.as_str()));
                self.error_sink
                    .host_error(host_id, &format!("[{tag}] {message}"));
            }
            Err(err @ (EvalError::Timeout { .. } | EvalError::Exception { .. })) if probing => {
                self.breaker.trip(&err.to_string(), None);
            }
            Err(_) => {}
        }

        result
    }

    async fn spawn_and_classify(
        &self,
        socket: Option<&str>,
        code: &str,
        timeout_ms: u64,
    ) -> Result<EvalOk, EvalError> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.config.client_bin);
        if let Some(socket) = socket {
            cmd.arg("-s").arg(socket);
        }
        cmd.arg("--eval")
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| EvalError::Exception {
            message: format!("failed to spawn {}: {e}", self.config.client_bin),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })?;

        // Dropping the timed-out future kills the child (kill_on_drop).
        let output = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EvalError::Exception {
                    message: format!("failed to collect client output: {e}"),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(_) => {
                return Err(EvalError::Timeout {
                    timeout_ms,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(EvalOk {
                output: unquote(stdout.trim()).to_string(),
                elapsed_ms,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            match self.classify_death(&stderr) {
                Some(tag) => Err(EvalError::HostDead {
                    tag,
                    message: stderr,
                    elapsed_ms,
                }),
                None => {
                    let message = if stderr.is_empty() {
                        format!("client exited with {}", output.status)
                    } else {
                        stderr
                    };
                    Err(EvalError::Exception {
                        message,
                        elapsed_ms,
                    })
                }
            }
        }
    }

    /// Match stderr against the host-death pattern table; first match
    /// wins.
    fn classify_death(&self, stderr: &str) -> Option<DeathTag> {
        self.death_patterns
            .iter()
            .find(|(re, _)| re.is_match(stderr))
            .map(|(_, tag)| *tag)
    }
}

fn death_patterns() -> Vec<(Regex, DeathTag)> {
    let table: [(&str, DeathTag); 6] = [
        (r"can't find socket", DeathTag::SocketNotFound),
        (r"no such file or directory", DeathTag::SocketMissing),
        (r"connection refused", DeathTag::ConnectionRefused),
        (r"connection reset", DeathTag::ConnectionReset),
        (r"server did not respond", DeathTag::ServerUnresponsive),
        (r"socket.*not available", DeathTag::SocketUnavailable),
    ];
    table
        .into_iter()
        .map(|(pattern, tag)| {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .unwrap();
            (re, tag)
        })
        .collect()
}

/// Strip one layer of surrounding double quotes, the round-trippable
/// string form the client prints for string results.
fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
