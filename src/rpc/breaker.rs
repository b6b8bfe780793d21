//! Circuit breaker guarding the editor-client subprocess
//!
//! Three states: `Closed` (calls pass), `Open` (calls rejected without
//! spawning anything), `HalfOpen` (one caller probes recovery). The
//! open state backs off exponentially; a successful probe closes the
//! circuit and resets the backoff. The `Open -> HalfOpen` edge is a
//! compare-and-swap so concurrent callers race to exactly one probe;
//! losers are rejected.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BreakerConfig;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_word(word: u8) -> Self {
        match word {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Outcome of the pre-call guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally.
    Proceed,
    /// Circuit half-open; the call is a recovery probe.
    Probe,
    /// Circuit open; do not spawn anything.
    Blocked,
}

#[derive(Default)]
struct Diagnostics {
    last_error: Option<String>,
    last_tag: Option<String>,
    recovery_at: Option<Instant>,
}

/// Point-in-time view of the breaker for status output.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub backoff_ms: u64,
    pub crash_count: u64,
    pub tripped_at: Option<Instant>,
    pub recovery_at: Option<Instant>,
    pub last_error: Option<String>,
    pub last_tag: Option<String>,
}

/// Process-wide circuit breaker for the editor-client subprocess.
pub struct CircuitBreaker {
    config: BreakerConfig,
    /// Anchor for the `tripped_at_ms` arithmetic.
    epoch: Instant,
    state: AtomicU8,
    /// Milliseconds since `epoch` of the last trip; `u64::MAX` = never.
    tripped_at_ms: AtomicU64,
    backoff_ms: AtomicU64,
    crash_count: AtomicU64,
    diag: Mutex<Diagnostics>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let backoff = config.initial_backoff_ms;
        Self {
            config,
            epoch: Instant::now(),
            state: AtomicU8::new(CLOSED),
            tripped_at_ms: AtomicU64::new(u64::MAX),
            backoff_ms: AtomicU64::new(backoff),
            crash_count: AtomicU64::new(0),
            diag: Mutex::new(Diagnostics::default()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Guard check, performed before any subprocess is spawned.
    pub fn admit(&self) -> Admission {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Admission::Proceed,
            HALF_OPEN => Admission::Probe,
            _ => {
                let tripped_at = self.tripped_at_ms.load(Ordering::Acquire);
                let backoff = self.backoff_ms.load(Ordering::Acquire);
                if tripped_at != u64::MAX && self.now_ms().saturating_sub(tripped_at) >= backoff {
                    // One caller wins the edge and probes; the rest stay out.
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        info!(backoff_ms = backoff, "Circuit half-open, probing host");
                        Admission::Probe
                    } else {
                        Admission::Blocked
                    }
                } else {
                    Admission::Blocked
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit when the call was a
    /// recovery probe; a success in the closed state changes nothing.
    pub fn on_success(&self, was_probe: bool) {
        if !was_probe {
            return;
        }
        if self
            .state
            .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.backoff_ms
                .store(self.config.initial_backoff_ms, Ordering::Release);
            self.diag.lock().recovery_at = Some(Instant::now());
            info!("Circuit closed after successful probe");
        }
    }

    /// Trip the breaker. From closed or half-open the backoff resets to
    /// its initial value; tripping an already-open breaker doubles it,
    /// capped at the configured maximum.
    pub fn trip(&self, message: &str, tag: Option<&str>) {
        let prior = self.state.swap(OPEN, Ordering::AcqRel);
        if prior == OPEN {
            let max = self.config.max_backoff_ms;
            let _ = self
                .backoff_ms
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                    Some(b.saturating_mul(2).min(max))
                });
        } else {
            self.backoff_ms
                .store(self.config.initial_backoff_ms, Ordering::Release);
        }
        self.tripped_at_ms.store(self.now_ms(), Ordering::Release);
        let crashes = self.crash_count.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let mut diag = self.diag.lock();
            diag.last_error = Some(message.to_string());
            diag.last_tag = tag.map(str::to_string);
        }

        warn!(
            crash_count = crashes,
            backoff_ms = self.backoff_ms.load(Ordering::Acquire),
            tag = tag.unwrap_or("-"),
            error = message,
            "Circuit tripped"
        );
    }

    /// Restore the closed state. Ops/test entry point; the crash count
    /// is history and survives.
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.backoff_ms
            .store(self.config.initial_backoff_ms, Ordering::Release);
        self.tripped_at_ms.store(u64::MAX, Ordering::Release);
        info!("Circuit manually reset to closed");
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_word(self.state.load(Ordering::Acquire))
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count.load(Ordering::Acquire)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let diag = self.diag.lock();
        let tripped_at_ms = self.tripped_at_ms.load(Ordering::Acquire);
        let tripped_at = if tripped_at_ms == u64::MAX {
            None
        } else {
            self.epoch
                .checked_add(std::time::Duration::from_millis(tripped_at_ms))
        };
        CircuitSnapshot {
            state: self.state(),
            backoff_ms: self.backoff_ms.load(Ordering::Acquire),
            crash_count: self.crash_count.load(Ordering::Acquire),
            tripped_at,
            recovery_at: diag.recovery_at,
            last_error: diag.last_error.clone(),
            last_tag: diag.last_tag.clone(),
        }
    }
}
