//! Health scoring for fleet hosts
//!
//! Pure functions over numbers; no I/O. A host's score starts at 100
//! and is pulled down by ping latency, consecutive failures, and load,
//! then smoothed with an exponentially weighted moving average so a
//! single bad sample does not crater the score.

/// Maximum (and initial) health score.
pub const SCORE_MAX: i64 = 100;

/// Latency at or below which no penalty applies, in milliseconds.
const LATENCY_FREE_MS: u64 = 500;
/// Latency at or above which the full penalty applies.
const LATENCY_WORST_MS: u64 = 2_000;
/// Penalty at `LATENCY_WORST_MS` (and for a failed measurement).
const LATENCY_MAX_PENALTY: i64 = 40;

/// Penalty per consecutive heartbeat failure.
const ERROR_PENALTY_STEP: i64 = 15;
/// Cap on the accumulated error penalty.
const ERROR_PENALTY_MAX: i64 = 50;

/// Penalty per worker beyond the first.
const LOAD_PENALTY_STEP: i64 = 2;

/// Bonus applied when a host recovers after one or more failures.
const RECOVERY_BONUS: i64 = 5;

/// Coarse health bucket derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    /// Score 70 or above
    Healthy,
    /// Score 30..=69
    Degraded,
    /// Score below 30
    Unhealthy,
}

impl HealthLevel {
    pub fn from_score(score: i64) -> Self {
        if score >= 70 {
            Self::Healthy
        } else if score >= 30 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Penalty for ping latency. `None` means the ping failed and draws
/// the full penalty.
pub fn latency_penalty(elapsed_ms: Option<u64>) -> i64 {
    match elapsed_ms {
        None => -LATENCY_MAX_PENALTY,
        Some(ms) if ms <= LATENCY_FREE_MS => 0,
        Some(ms) if ms >= LATENCY_WORST_MS => -LATENCY_MAX_PENALTY,
        Some(ms) => {
            let span = (LATENCY_WORST_MS - LATENCY_FREE_MS) as i64;
            -((ms - LATENCY_FREE_MS) as i64 * LATENCY_MAX_PENALTY / span)
        }
    }
}

/// Penalty for consecutive heartbeat failures, capped.
pub fn error_penalty(consecutive_failures: u32) -> i64 {
    -(ERROR_PENALTY_MAX.min(ERROR_PENALTY_STEP * i64::from(consecutive_failures)))
}

/// Penalty for bound workers; the first worker is free.
pub fn load_penalty(worker_count: usize) -> i64 {
    -(LOAD_PENALTY_STEP * (worker_count as i64 - 1).max(0))
}

/// Raw score for a single measurement, clamped to `[0, 100]`.
pub fn raw_score(elapsed_ms: Option<u64>, consecutive_failures: u32, worker_count: usize) -> i64 {
    let score = SCORE_MAX
        + latency_penalty(elapsed_ms)
        + error_penalty(consecutive_failures)
        + load_penalty(worker_count);
    score.clamp(0, SCORE_MAX)
}

/// EWMA blend of a raw measurement into the previous score with
/// smoothing 0.3. Integer arithmetic: `(3*raw + 7*prev) / 10`.
pub fn blend(raw: i64, prev: i64) -> i64 {
    (3 * raw + 7 * prev) / 10
}

/// Full rescoring step: raw score, EWMA blend, and the recovery bonus
/// when a successful measurement follows one or more failures.
pub fn rescore(
    prev_score: i64,
    elapsed_ms: Option<u64>,
    consecutive_failures: u32,
    worker_count: usize,
    recovering: bool,
) -> i64 {
    let raw = raw_score(elapsed_ms, consecutive_failures, worker_count);
    let mut score = blend(raw, prev_score);
    if elapsed_ms.is_some() && recovering {
        score = (score + RECOVERY_BONUS).min(SCORE_MAX);
    }
    score.clamp(0, SCORE_MAX)
}
