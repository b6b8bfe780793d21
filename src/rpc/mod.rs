mod breaker;
mod client;

pub use breaker::{Admission, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::{DeathTag, EvalError, EvalOk, HostErrorSink, RpcClient};

use async_trait::async_trait;

/// Minimal no-op payload used for heartbeat pings.
pub const PING_PAYLOAD: &str = "t";

/// The heartbeat loop's view of the RPC client: ping one host with a
/// deadline. Implemented by [`RpcClient`]; faked in tests.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(
        &self,
        host_id: &str,
        socket: Option<&str>,
        timeout_ms: u64,
    ) -> Result<EvalOk, EvalError>;
}

#[async_trait]
impl Pinger for RpcClient {
    async fn ping(
        &self,
        host_id: &str,
        socket: Option<&str>,
        timeout_ms: u64,
    ) -> Result<EvalOk, EvalError> {
        self.eval_on(host_id, socket, PING_PAYLOAD, timeout_ms).await
    }
}
