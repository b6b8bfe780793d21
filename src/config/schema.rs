use serde::Deserialize;

/// Name of the default host when no socket name is configured.
pub const DEFAULT_HOST_ID: &str = "server";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub redistribution: RedistributionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Editor-client subprocess configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Path to the editor client binary (`EMACSCLIENT` overrides)
    #[serde(default = "default_client_bin")]
    pub client_bin: String,
    /// Socket name of the default host (`EMACS_SOCKET_NAME` overrides).
    /// When unset, the client is invoked without `-s`.
    #[serde(default = "default_socket_name")]
    pub socket_name: Option<String>,
    /// Hard ceiling for any single eval, in milliseconds
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_client_bin() -> String {
    std::env::var("EMACSCLIENT").unwrap_or_else(|_| "emacsclient".to_string())
}

fn default_socket_name() -> Option<String> {
    std::env::var("EMACS_SOCKET_NAME").ok().filter(|s| !s.is_empty())
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            client_bin: default_client_bin(),
            socket_name: default_socket_name(),
            max_timeout_ms: default_max_timeout_ms(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Identifier of the default host: the socket name when one is
    /// configured, a fixed literal otherwise.
    pub fn default_host_id(&self) -> String {
        self.socket_name
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST_ID.to_string())
    }
}

/// Circuit breaker backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Heartbeat loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat ticks
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Per-host ping timeout
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Interval between stale detection / healing / redistribution passes
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Hosts with no successful ping for this long are marked stale
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Consecutive heartbeat failures before a host is marked errored
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_ping_timeout_ms() -> u64 {
    3_000
}

fn default_cleanup_interval_ms() -> u64 {
    120_000
}

fn default_stale_after_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Placement selector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_max_workers_per_host")]
    pub max_workers_per_host: usize,
}

fn default_max_workers_per_host() -> usize {
    5
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_workers_per_host: default_max_workers_per_host(),
        }
    }
}

/// Redistribution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedistributionConfig {
    /// Minimum score improvement for a migration to be worth the churn
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: i64,
    /// Worker count at which an active host counts as overloaded
    #[serde(default = "default_overloaded_worker_count")]
    pub overloaded_worker_count: usize,
    #[serde(default = "default_max_migrations_per_cycle")]
    pub max_migrations_per_cycle: usize,
}

fn default_improvement_threshold() -> i64 {
    20
}

fn default_overloaded_worker_count() -> usize {
    4
}

fn default_max_migrations_per_cycle() -> usize {
    2
}

impl Default for RedistributionConfig {
    fn default() -> Self {
        Self {
            improvement_threshold: default_improvement_threshold(),
            overloaded_worker_count: default_overloaded_worker_count(),
            max_migrations_per_cycle: default_max_migrations_per_cycle(),
        }
    }
}

/// Metrics exposition configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_listen_port")]
    pub listen_port: u16,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_metrics_listen_port() -> u16 {
    9641
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: default_metrics_listen_addr(),
            listen_port: default_metrics_listen_port(),
        }
    }
}
