//! Argus supervises a fleet of long-running editor daemons ("hosts") and
//! the logical workers bound to them.
//!
//! The control plane is built from a handful of pieces: an RPC client
//! guarded by a circuit breaker ([`rpc`]), a host registry holding
//! lifecycle state and worker bindings ([`registry`]), pure health
//! scoring ([`health`]), a placement selector ([`placement`]), an orphan
//! reaper ([`heal`]), an idle-worker redistributor ([`redistribute`]),
//! and the supervisor that drives the heartbeat loop ([`supervisor`]).

pub mod config;
pub mod events;
pub mod heal;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod placement;
pub mod redistribute;
pub mod registry;
pub mod rpc;
pub mod supervisor;
pub mod workers;
