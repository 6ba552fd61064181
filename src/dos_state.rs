/// DOS State Tracker
///
/// Process-wide self-assigned penalty score plus the operator-facing reason.
/// Every health component feeds penalties in; only a fully clean
/// availability check resets it, and a confirmed identity collision latches
/// it at the collision score until the process restarts.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::lock_utils::lock_or_recover;

/// Above this score the node stops reporting itself as available
pub const DOS_THRESHOLD: f64 = 10.0;

/// Score reserved for a confirmed identity collision
pub const COLLISION_SCORE: f64 = 100.0;

/// Snapshot of the DOS state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosState {
    /// Accumulated penalty score (fractional penalties are allowed)
    pub score: f64,
    /// Last reason recorded for the score or a standing policy violation
    pub reason: Option<String>,
    /// Whether a collision has latched the score
    pub collision: bool,
    /// Last mutation time (unix milliseconds)
    pub updated_at_ms: i64,
}

impl DosState {
    /// Whether the score currently suppresses positive availability outcomes
    pub fn exceeds_threshold(&self) -> bool {
        self.score > DOS_THRESHOLD
    }
}

impl Default for DosState {
    fn default() -> Self {
        Self {
            score: 0.0,
            reason: None,
            collision: false,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Tracker owning the DOS state
#[derive(Debug, Default)]
pub struct DosTracker {
    state: Mutex<DosState>,
}

impl DosTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add penalty points and record the reason. Returns the new score.
    ///
    /// Non-positive or non-finite amounts are ignored so the score never
    /// decreases outside of [`DosTracker::reset`].
    pub fn add_penalty(&self, points: f64, reason: &str) -> f64 {
        let mut state = lock_or_recover(&self.state, "dos state");
        if !points.is_finite() || points <= 0.0 {
            return state.score;
        }

        state.score += points;
        if !state.collision {
            state.reason = Some(reason.to_string());
        }
        state.updated_at_ms = chrono::Utc::now().timestamp_millis();

        warn!(
            "DOS penalty +{:.2} -> score {:.2}: {}",
            points, state.score, reason
        );
        state.score
    }

    /// Latch the score at the collision level. Only a restart clears it.
    pub fn mark_collision(&self, reason: &str) {
        let mut state = lock_or_recover(&self.state, "dos state");
        state.score = state.score.max(COLLISION_SCORE);
        state.reason = Some(reason.to_string());
        state.collision = true;
        state.updated_at_ms = chrono::Utc::now().timestamp_millis();

        error!("Node identity collision, DOS score {:.2}: {}", state.score, reason);
    }

    /// Record a standing policy violation without touching the score
    pub fn flag(&self, reason: &str) {
        let mut state = lock_or_recover(&self.state, "dos state");
        if state.collision {
            return;
        }
        state.reason = Some(reason.to_string());
        state.updated_at_ms = chrono::Utc::now().timestamp_millis();

        warn!("DOS flag: {}", reason);
    }

    /// Clear score and reason after a fully clean availability check.
    ///
    /// Returns `false` when the score is latched at the collision level.
    pub fn reset(&self) -> bool {
        let mut state = lock_or_recover(&self.state, "dos state");
        if state.collision || state.score >= COLLISION_SCORE {
            return false;
        }

        if state.score > 0.0 || state.reason.is_some() {
            info!("DOS state reset from score {:.2}", state.score);
        }
        state.score = 0.0;
        state.reason = None;
        state.updated_at_ms = chrono::Utc::now().timestamp_millis();
        true
    }

    /// Current snapshot
    pub fn state(&self) -> DosState {
        lock_or_recover(&self.state, "dos state").clone()
    }

    pub fn score(&self) -> f64 {
        lock_or_recover(&self.state, "dos state").score
    }

    pub fn exceeds_threshold(&self) -> bool {
        self.score() > DOS_THRESHOLD
    }

    pub fn is_collision(&self) -> bool {
        lock_or_recover(&self.state, "dos state").collision
    }
}
